//! Optimistic command dispatch for one machine, one consumer session.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::Serialize;
use shared::protocol::MutationRequest;
use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    error::CommandError,
    ingestion::{MachineNamespace, MachineStore},
    optimistic::OptimisticState,
    registry::NamespaceHandle,
    schema::Contract,
    store::{Store, Subscription},
    transport::MutationTransport,
};

const CONTROLLER_EVENT_CAPACITY: usize = 64;

/// A named outbound intent, serialized as `{"action": ..., "value": ...}`.
pub trait MachineCommand: Serialize + fmt::Debug + Send + Sync + 'static {
    type State;

    fn action(&self) -> &'static str;

    /// Envelope contract the serialized command must satisfy.
    fn contract(&self) -> Contract;

    /// Business-rule pre-check (index ranges).
    fn check_bounds(&self) -> Result<(), CommandError> {
        Ok(())
    }

    /// Predicted next state, or `None` when the effect is not safe to predict.
    /// Only called once `check_bounds` has passed.
    fn predict(&self, current: &Self::State) -> Option<Self::State>;
}

pub fn check_index(
    action: &'static str,
    field: &'static str,
    index: usize,
    len: usize,
) -> Result<(), CommandError> {
    if index < len {
        Ok(())
    } else {
        Err(CommandError::OutOfRange {
            action,
            field,
            index,
            len,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Accepted,
    /// The server answered with anything but `success: true`.
    Rejected(String),
    /// Network error or timeout.
    TransportFailed(String),
}

impl CommandOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Transient notifications for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    RequestFailed {
        action: &'static str,
        message: String,
    },
    TransportFailed {
        action: &'static str,
        message: String,
    },
}

/// Returned by [`MachineController::dispatch`]. Dropping it does not cancel
/// the request.
#[derive(Debug)]
pub struct DispatchHandle {
    action: &'static str,
    predicted: bool,
    task: JoinHandle<CommandOutcome>,
}

impl DispatchHandle {
    pub fn action(&self) -> &'static str {
        self.action
    }

    /// Whether this command's prediction was installed.
    pub fn predicted(&self) -> bool {
        self.predicted
    }

    pub async fn outcome(self) -> CommandOutcome {
        self.task.await.unwrap_or_else(|err| {
            CommandOutcome::TransportFailed(format!("request task failed: {err}"))
        })
    }
}

pub struct MachineController<N: MachineNamespace> {
    namespace: NamespaceHandle<N>,
    optimistic: Store<OptimisticState<N::State>>,
    transport: Arc<dyn MutationTransport>,
    events: broadcast::Sender<ControllerEvent>,
    _binding: Subscription,
}

impl<N: MachineNamespace> MachineController<N> {
    pub fn new(namespace: NamespaceHandle<N>, transport: Arc<dyn MutationTransport>) -> Self {
        let optimistic = Store::new(OptimisticState::new());
        let last_revision = Arc::new(AtomicU64::new(0));

        let sync = {
            let optimistic = optimistic.clone();
            move |snapshot: &Arc<MachineStore<N>>| {
                sync_real::<N>(&optimistic, &last_revision, snapshot);
            }
        };
        let binding = namespace.subscribe(sync.clone());
        sync(&namespace.snapshot());

        let (events, _) = broadcast::channel(CONTROLLER_EVENT_CAPACITY);
        Self {
            namespace,
            optimistic,
            transport,
            events,
            _binding: binding,
        }
    }

    pub fn namespace(&self) -> &NamespaceHandle<N> {
        &self.namespace
    }

    pub fn view(&self) -> Arc<OptimisticState<N::State>> {
        self.optimistic.get()
    }

    /// Displayed state: prediction if present, else last confirmed state.
    pub fn state(&self) -> Option<N::State> {
        self.optimistic.get().value().cloned()
    }

    pub fn default_state(&self) -> Option<N::State> {
        self.namespace.snapshot().default_state_data().cloned()
    }

    pub fn live_values(&self) -> Option<N::LiveValues> {
        self.namespace.snapshot().live_values_data().cloned()
    }

    /// A prediction is displayed and awaiting confirmation.
    pub fn is_loading(&self) -> bool {
        self.optimistic.get().is_optimistic()
    }

    /// No server state has arrived yet; controls should stay disabled.
    pub fn is_disabled(&self) -> bool {
        !self.optimistic.get().is_initialized()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&Arc<OptimisticState<N::State>>) + Send + Sync + 'static,
    ) -> Subscription {
        self.optimistic.subscribe(listener)
    }

    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Validates `command`, installs its prediction unless one is already
    /// displayed, and sends it. The response is reconciled in the background:
    /// any failure rolls the display back to the last real state.
    pub fn dispatch<C>(&self, command: C) -> Result<DispatchHandle, CommandError>
    where
        C: MachineCommand<State = N::State>,
    {
        let action = command.action();
        command.check_bounds()?;
        let envelope =
            serde_json::to_value(&command).map_err(|source| CommandError::Encode { action, source })?;
        command.contract().check(&envelope)?;
        let runtime = Handle::try_current().map_err(|_| CommandError::NoRuntime { action })?;

        let predicted = self.optimistic.modify(|state| {
            if state.is_optimistic() {
                return false;
            }
            match state.real().and_then(|current| command.predict(current)) {
                Some(next) => state.set_optimistic(next),
                None => false,
            }
        });
        debug!(
            kind = N::KIND,
            namespace = %self.namespace.id(),
            action,
            predicted,
            "dispatching command"
        );

        let request = MutationRequest {
            machine_identification_unique: *self.namespace.id().machine_identification_unique(),
            data: envelope,
        };
        let transport = Arc::clone(&self.transport);
        let optimistic = self.optimistic.clone();
        let events = self.events.clone();
        let task = runtime.spawn(async move {
            let outcome = match transport.mutate(request).await {
                Ok(response) if response.success => CommandOutcome::Accepted,
                Ok(response) => CommandOutcome::Rejected(
                    response
                        .error
                        .unwrap_or_else(|| "server reported failure".to_string()),
                ),
                Err(err) => CommandOutcome::TransportFailed(err.to_string()),
            };
            let notification = match &outcome {
                CommandOutcome::Accepted => None,
                CommandOutcome::Rejected(message) => Some(ControllerEvent::RequestFailed {
                    action,
                    message: message.clone(),
                }),
                CommandOutcome::TransportFailed(message) => Some(ControllerEvent::TransportFailed {
                    action,
                    message: message.clone(),
                }),
            };
            if let Some(notification) = notification {
                let rolled_back = optimistic.modify(|state| state.reset_to_real());
                warn!(action, rolled_back, ?outcome, "command failed");
                let _ = events.send(notification);
            }
            outcome
        });

        Ok(DispatchHandle {
            action,
            predicted,
            task,
        })
    }
}

fn sync_real<N: MachineNamespace>(
    optimistic: &Store<OptimisticState<N::State>>,
    last_revision: &AtomicU64,
    snapshot: &MachineStore<N>,
) {
    let Some(state) = snapshot.state_data() else {
        return;
    };
    if last_revision.fetch_max(snapshot.state_revision, Ordering::AcqRel) >= snapshot.state_revision
    {
        return;
    }
    let state = state.clone();
    optimistic.modify(|view| view.set_real(state));
}

impl<N: MachineNamespace> fmt::Debug for MachineController<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineController")
            .field("namespace", &self.namespace)
            .field("view", &*self.optimistic.get())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
