//! Dispatcher loop that serializes command execution.
//!
//! The dispatcher runs as a tokio task and sequentially processes messages
//! from an unbounded `mpsc` channel. For each command it runs the handler
//! in its own task (so a panic is contained), applies the returned
//! mutations to the [`StateStore`] atomically, records the inverse command
//! for undo and publishes exactly one event on the [`EventBus`].
//!
//! Crate-internal API: [`CommandQueue`] (cloneable sending side) and
//! [`spawn_dispatcher`] (starts the loop).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::bus::EventBus;
use crate::command::{Command, CorrelationId};
use crate::context::HandlerContext;
use crate::error::{DispatchError, ErrorKind, HandlerError};
use crate::event::{COMMAND_SUCCEEDED, Event};
use crate::handler::CommandHandler;
use crate::model::Model;
use crate::store::StateStore;
use crate::undo::UndoLog;

/// Registered command handlers keyed by command type.
pub(crate) type CommandHandlers<M, B> = HashMap<String, Arc<dyn CommandHandler<M, B>>>;

/// Messages sent from [`CommandQueue`] to the dispatcher loop.
pub(crate) enum DispatcherMessage {
    /// Run a command.
    Execute {
        /// The command, with its correlation ID already assigned.
        command: Command,
        /// Whether to record the command's inverse in the undo log.
        /// `false` for commands issued by undo itself.
        record_undo: bool,
    },

    /// Stop after everything queued before this message has run.
    Shutdown {
        /// Signalled once the loop has stopped taking commands.
        reply: oneshot::Sender<()>,
    },
}

/// Sending side of the dispatcher's queue.
///
/// Validates the command type against the handler registry before
/// queueing, so unknown commands fail synchronously.
pub(crate) struct CommandQueue<M: Model, B> {
    sender: mpsc::UnboundedSender<DispatcherMessage>,
    handlers: Arc<CommandHandlers<M, B>>,
}

// Manual `Clone`: neither `M` nor `B` needs to be `Clone`.
impl<M: Model, B> Clone for CommandQueue<M, B> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<M: Model, B> fmt::Debug for CommandQueue<M, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl<M: Model, B> CommandQueue<M, B> {
    /// Queue a command behind everything already queued.
    ///
    /// # Returns
    ///
    /// The command's correlation ID (assigned here when absent).
    ///
    /// # Errors
    ///
    /// * [`DispatchError::UnknownCommand`] -- no handler for the type.
    /// * [`DispatchError::DispatcherGone`] -- the loop has exited.
    pub(crate) fn enqueue(
        &self,
        mut command: Command,
        record_undo: bool,
    ) -> Result<CorrelationId, DispatchError> {
        if !self.handlers.contains_key(&command.command_type) {
            return Err(DispatchError::UnknownCommand(command.command_type));
        }
        let correlation_id = command.ensure_correlation_id();
        tracing::debug!(
            command_type = %command.command_type,
            %correlation_id,
            "command queued"
        );
        self.sender
            .send(DispatcherMessage::Execute {
                command,
                record_undo,
            })
            .map_err(|_| DispatchError::DispatcherGone)?;
        Ok(correlation_id)
    }

    /// Whether a handler is registered for `command_type`.
    pub(crate) fn handles(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    /// Ask the loop to stop once the commands queued so far have run.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DispatcherGone`] if the loop already exited.
    pub(crate) async fn shutdown(&self) -> Result<(), DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DispatcherMessage::Shutdown { reply: tx })
            .map_err(|_| DispatchError::DispatcherGone)?;
        rx.await.map_err(|_| DispatchError::DispatcherGone)
    }

    /// Check whether the dispatcher loop is still running.
    pub(crate) fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// A handle that does not keep the loop alive.
    pub(crate) fn downgrade(&self) -> WeakCommandQueue<M, B> {
        WeakCommandQueue {
            sender: self.sender.downgrade(),
            handlers: Arc::clone(&self.handlers),
        }
    }
}

/// Non-owning [`CommandQueue`].
///
/// Held by the dispatcher and the query processor so that the loop exits
/// when the last engine handle is dropped.
pub(crate) struct WeakCommandQueue<M: Model, B> {
    sender: mpsc::WeakUnboundedSender<DispatcherMessage>,
    handlers: Arc<CommandHandlers<M, B>>,
}

impl<M: Model, B> Clone for WeakCommandQueue<M, B> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<M: Model, B> WeakCommandQueue<M, B> {
    pub(crate) fn upgrade(&self) -> Option<CommandQueue<M, B>> {
        Some(CommandQueue {
            sender: self.sender.upgrade()?,
            handlers: Arc::clone(&self.handlers),
        })
    }
}

/// Everything the loop needs to run a command.
struct Dispatcher<M: Model, B> {
    store: StateStore<M>,
    bus: EventBus,
    backend: Arc<B>,
    handlers: Arc<CommandHandlers<M, B>>,
    queue: WeakCommandQueue<M, B>,
    undo: UndoLog,
}

/// Spawn the dispatcher loop on the current tokio runtime.
///
/// # Arguments
///
/// * `store` - State the handlers read and the loop mutates.
/// * `bus` - Where result events are published.
/// * `backend` - Capability handed to handlers through their context.
/// * `handlers` - Command handler registry; immutable from here on.
/// * `undo` - Log receiving inverse commands.
///
/// # Returns
///
/// The queue for submitting commands and the loop's task handle.
pub(crate) fn spawn_dispatcher<M, B>(
    store: StateStore<M>,
    bus: EventBus,
    backend: Arc<B>,
    handlers: CommandHandlers<M, B>,
    undo: UndoLog,
) -> (CommandQueue<M, B>, JoinHandle<()>)
where
    M: Model,
    B: Send + Sync + 'static,
{
    let (sender, receiver) = mpsc::unbounded_channel();
    let handlers = Arc::new(handlers);
    let queue = CommandQueue {
        sender,
        handlers: Arc::clone(&handlers),
    };
    let dispatcher = Dispatcher {
        store,
        bus,
        backend,
        handlers,
        queue: queue.downgrade(),
        undo,
    };
    let task = tokio::spawn(run_dispatcher(dispatcher, receiver));
    (queue, task)
}

/// Runs the dispatcher loop.
///
/// Processes messages strictly in arrival order; a command is fully
/// settled (state applied, event published) before the next one starts.
/// The loop exits when every [`CommandQueue`] is dropped or a `Shutdown`
/// message is received. Commands that raced in behind a `Shutdown` are
/// answered with a failure event so no waiter hangs.
async fn run_dispatcher<M, B>(
    dispatcher: Dispatcher<M, B>,
    mut receiver: mpsc::UnboundedReceiver<DispatcherMessage>,
) where
    M: Model,
    B: Send + Sync + 'static,
{
    while let Some(message) = receiver.recv().await {
        match message {
            DispatcherMessage::Execute {
                command,
                record_undo,
            } => dispatcher.execute(command, record_undo).await,
            DispatcherMessage::Shutdown { reply } => {
                receiver.close();
                while let Ok(late) = receiver.try_recv() {
                    if let DispatcherMessage::Execute { command, .. } = late {
                        let correlation_id = command.correlation_id.clone().unwrap_or_default();
                        dispatcher.fail(
                            &command,
                            &correlation_id,
                            &HandlerError::Internal("engine is shutting down".into()),
                        );
                    }
                }
                tracing::info!("dispatcher shut down");
                let _ = reply.send(());
                return;
            }
        }
    }
    tracing::debug!("all command queues dropped, dispatcher exiting");
}

impl<M, B> Dispatcher<M, B>
where
    M: Model,
    B: Send + Sync + 'static,
{
    async fn execute(&self, command: Command, record_undo: bool) {
        let correlation_id = command.correlation_id.clone().unwrap_or_default();
        let span = tracing::info_span!(
            "command",
            command_type = %command.command_type,
            correlation_id = %correlation_id,
        );
        self.execute_in_span(command, correlation_id, record_undo)
            .instrument(span)
            .await;
    }

    async fn execute_in_span(&self, command: Command, correlation_id: CorrelationId, record_undo: bool) {
        // 1. Look up the handler. `enqueue` validated the type and the
        //    registry is immutable, so a miss is an engine bug.
        let Some(handler) = self.handlers.get(&command.command_type).cloned() else {
            let err = HandlerError::Internal(format!("no handler for {}", command.command_type));
            return self.fail(&command, &correlation_id, &err);
        };

        // 2. Run the handler in its own task so a panic is reported as a
        //    failure instead of taking the loop down.
        let ctx = HandlerContext::new(
            self.store.clone(),
            Arc::clone(&self.backend),
            self.queue.upgrade(),
            Some(correlation_id.clone()),
        );
        let task_command = command.clone();
        let joined = tokio::spawn(
            async move { handler.handle(&ctx, &task_command).await }.in_current_span(),
        )
        .await;

        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return self.fail(&command, &correlation_id, &err),
            Err(join_err) => {
                let err = HandlerError::Internal(format!("command handler panicked: {join_err}"));
                return self.fail(&command, &correlation_id, &err);
            }
        };

        // 3. Apply all mutations or none.
        if let Err(err) = self.store.apply_all(&outcome.mutations) {
            let err = HandlerError::Consistency(err.to_string());
            return self.fail(&command, &correlation_id, &err);
        }

        // 4. Remember how to undo it.
        if record_undo && let Some(inverse) = outcome.inverse {
            self.undo
                .record(correlation_id.clone(), &command.command_type, inverse);
        }

        // 5. Announce the result.
        let event_type = outcome
            .event_type
            .unwrap_or_else(|| COMMAND_SUCCEEDED.to_string());
        let payload = if outcome.event_payload.is_null() {
            json!({ "command_type": command.command_type })
        } else {
            outcome.event_payload
        };
        tracing::info!(
            %event_type,
            mutations = outcome.mutations.len(),
            "command succeeded"
        );
        let mut event = Event::new(event_type, payload).with_correlation_id(correlation_id);
        event.causation_id = command.causation_id.clone();
        self.bus.publish(event);
    }

    fn fail(&self, command: &Command, correlation_id: &str, err: &HandlerError) {
        match err.kind() {
            ErrorKind::Validation | ErrorKind::Rejected => {
                tracing::warn!(kind = ?err.kind(), error = %err, "command not applied")
            }
            _ => tracing::error!(kind = ?err.kind(), error = %err, "command failed"),
        }
        let mut event = Event::command_failure(&command.command_type, correlation_id, err);
        event.causation_id = command.causation_id.clone();
        self.bus.publish(event);
    }
}
