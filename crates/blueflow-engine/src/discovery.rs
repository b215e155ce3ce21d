/*!
 * Generic child enumeration.
 *
 * A [`DiscoveryStateMachine`] runs an injected [`DiscoveryStrategy`] and
 * folds its outcome into a [`DiscoveryState`]. At most one round is in
 * flight at a time; a result is applied only if the machine is still
 * `Discovering` for the same round, otherwise it is dropped.
 */
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use blueflow_core::config::EngineConfig;
use blueflow_core::state::{StatePublisher, StateStream};
use blueflow_core::utils::spawn_actor;

/// Discovery state of an entity's children
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryState<V, E> {
    /// No discovery has been requested yet
    NotDiscoveredYet,
    /// A round is in flight; carries the last known list, if any
    Discovering(Option<Vec<V>>),
    /// The last round succeeded
    Discovered(Vec<V>),
    /// The last round failed; carries the last known list, if any
    DiscoveryFailed(E, Option<Vec<V>>),
}

impl<V, E> DiscoveryState<V, E> {
    /// Whether a round is in flight
    pub fn is_discovering(&self) -> bool {
        matches!(self, DiscoveryState::Discovering(_))
    }

    /// The last known list of children, in any state that has one
    pub fn values(&self) -> Option<&[V]> {
        match self {
            DiscoveryState::NotDiscoveredYet => None,
            DiscoveryState::Discovering(previous) => previous.as_deref(),
            DiscoveryState::Discovered(values) => Some(values),
            DiscoveryState::DiscoveryFailed(_, previous) => previous.as_deref(),
        }
    }

    /// The failure of the last round, if it failed
    pub fn error(&self) -> Option<&E> {
        match self {
            DiscoveryState::DiscoveryFailed(error, _) => Some(error),
            _ => None,
        }
    }
}

impl<V, E> Default for DiscoveryState<V, E> {
    fn default() -> Self {
        DiscoveryState::NotDiscoveredYet
    }
}

/// Strategy enumerating an entity's children
#[async_trait]
pub trait DiscoveryStrategy<V, E>: Send + Sync {
    /// Run one discovery round
    async fn discover(&self) -> Result<Vec<V>, E>;
}

/// Adapter turning a closure into a [`DiscoveryStrategy`]
pub struct FnStrategy<F>(F);

impl<F> FnStrategy<F> {
    /// Wrap a closure returning a discovery future
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<V, E, F, Fut> DiscoveryStrategy<V, E> for FnStrategy<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<V>, E>> + Send,
    V: Send + 'static,
    E: Send + 'static,
{
    async fn discover(&self) -> Result<Vec<V>, E> {
        (self.0)().await
    }
}

enum DiscoveryCommand {
    Discover,
    Reset,
}

struct Completion<V, E> {
    round: u64,
    result: Result<Vec<V>, E>,
}

/// Handle to a discovery actor
pub struct DiscoveryStateMachine<V, E> {
    commands: mpsc::UnboundedSender<DiscoveryCommand>,
    state: StatePublisher<DiscoveryState<V, E>>,
}

impl<V, E> Clone for DiscoveryStateMachine<V, E> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
        }
    }
}

impl<V, E> Debug for DiscoveryStateMachine<V, E>
where
    V: Clone + Debug + Send + 'static,
    E: Clone + Debug + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryStateMachine")
            .field("state", &self.state.current())
            .finish()
    }
}

impl<V, E> DiscoveryStateMachine<V, E>
where
    V: Clone + Debug + Send + Sync + 'static,
    E: Clone + Debug + Send + Sync + 'static,
{
    /// Create a discovery machine and spawn its actor
    ///
    /// `label` names the entity in logs. Must be called from within a
    /// Tokio runtime.
    pub fn new(
        label: impl Into<String>,
        strategy: Arc<dyn DiscoveryStrategy<V, E>>,
        config: EngineConfig,
    ) -> Self {
        let label = label.into();
        let state = StatePublisher::with_capacity(
            DiscoveryState::NotDiscoveredYet,
            config.state_channel_capacity,
        );
        let (commands, receiver) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let actor = DiscoveryActor {
            label: label.clone(),
            strategy,
            state: state.clone(),
            commands: receiver,
            completions_tx,
            completions_rx,
            round: 0,
        };
        spawn_actor("discovery", Some(&label), actor.run());

        Self { commands, state }
    }

    /// Current discovery state
    pub fn state(&self) -> DiscoveryState<V, E> {
        self.state.current()
    }

    /// Subscribe to discovery state changes, starting with the current state
    pub fn subscribe(&self) -> StateStream<DiscoveryState<V, E>> {
        self.state.subscribe()
    }

    /// Start a discovery round unless one is already in flight
    pub fn discover(&self) {
        self.send(DiscoveryCommand::Discover);
    }

    /// Return to `NotDiscoveredYet`, superseding any round in flight
    pub fn reset(&self) {
        self.send(DiscoveryCommand::Reset);
    }

    fn send(&self, command: DiscoveryCommand) {
        if self.commands.send(command).is_err() {
            warn!("Discovery machine has stopped");
        }
    }
}

struct DiscoveryActor<V, E> {
    label: String,
    strategy: Arc<dyn DiscoveryStrategy<V, E>>,
    state: StatePublisher<DiscoveryState<V, E>>,
    commands: mpsc::UnboundedReceiver<DiscoveryCommand>,
    completions_tx: mpsc::UnboundedSender<Completion<V, E>>,
    completions_rx: mpsc::UnboundedReceiver<Completion<V, E>>,
    round: u64,
}

impl<V, E> DiscoveryActor<V, E>
where
    V: Clone + Debug + Send + Sync + 'static,
    E: Clone + Debug + Send + Sync + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(DiscoveryCommand::Discover) => self.start_round(),
                    Some(DiscoveryCommand::Reset) => self.reset(),
                    None => break,
                },
                Some(completion) = self.completions_rx.recv() => self.complete(completion),
            }
        }

        debug!("Discovery machine for {} stopped", self.label);
    }

    fn start_round(&mut self) {
        let previous = match self.state.current() {
            DiscoveryState::Discovering(_) => {
                debug!("Discovery for {} already in flight", self.label);
                return;
            }
            DiscoveryState::NotDiscoveredYet => None,
            DiscoveryState::Discovered(values) => Some(values),
            DiscoveryState::DiscoveryFailed(_, previous) => previous,
        };

        self.round += 1;
        let round = self.round;
        debug!("Discovery round {} for {} started", round, self.label);
        self.state.publish(DiscoveryState::Discovering(previous));

        let strategy = self.strategy.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = strategy.discover().await;
            // The actor may be gone; the result is then simply dropped
            let _ = completions.send(Completion { round, result });
        });
    }

    fn reset(&mut self) {
        debug!("Discovery for {} reset", self.label);
        self.state.publish(DiscoveryState::NotDiscoveredYet);
    }

    fn complete(&mut self, completion: Completion<V, E>) {
        let previous = match self.state.current() {
            DiscoveryState::Discovering(previous) if completion.round == self.round => previous,
            state => {
                warn!(
                    "Dropping stale discovery result for {} (round {}, now {:?})",
                    self.label, completion.round, state
                );
                return;
            }
        };

        match completion.result {
            Ok(values) => {
                debug!("Discovery for {} found {} entries", self.label, values.len());
                self.state.publish(DiscoveryState::Discovered(values));
            }
            Err(error) => {
                warn!("Discovery for {} failed: {:?}", self.label, error);
                self.state.publish(DiscoveryState::DiscoveryFailed(error, previous));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    type State = DiscoveryState<u32, String>;

    /// Strategy whose rounds are completed by the test
    #[derive(Default)]
    struct ScriptedStrategy {
        calls: AtomicUsize,
        pending: Mutex<Vec<oneshot::Sender<Result<Vec<u32>, String>>>>,
    }

    impl ScriptedStrategy {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn resolve(&self, result: Result<Vec<u32>, String>) {
            let sender = self.pending.lock().unwrap().remove(0);
            sender.send(result).unwrap();
        }
    }

    #[async_trait]
    impl DiscoveryStrategy<u32, String> for ScriptedStrategy {
        async fn discover(&self) -> Result<Vec<u32>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            self.pending.lock().unwrap().push(tx);
            rx.await.unwrap_or_else(|_| Err("cancelled".to_string()))
        }
    }

    fn machine() -> (DiscoveryStateMachine<u32, String>, Arc<ScriptedStrategy>) {
        let strategy = Arc::new(ScriptedStrategy::default());
        let machine = DiscoveryStateMachine::new("test", strategy.clone(), EngineConfig::default());
        (machine, strategy)
    }

    async fn wait_for_calls(strategy: &ScriptedStrategy, n: usize) {
        tokio::time::timeout(WAIT, async {
            while strategy.calls() < n || strategy.pending.lock().unwrap().len() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("strategy invoked");
    }

    #[tokio::test]
    async fn test_successful_discovery() {
        let (machine, strategy) = machine();
        let mut stream = machine.subscribe();
        assert_eq!(stream.next().await, Some(State::NotDiscoveredYet));

        machine.discover();
        assert_eq!(stream.next().await, Some(State::Discovering(None)));

        wait_for_calls(&strategy, 1).await;
        strategy.resolve(Ok(vec![1, 2, 3]));
        assert_eq!(stream.next().await, Some(State::Discovered(vec![1, 2, 3])));
    }

    #[tokio::test]
    async fn test_discover_is_idempotent_while_in_flight() {
        let (machine, strategy) = machine();
        let mut stream = machine.subscribe();

        machine.discover();
        machine.discover();
        machine.discover();
        stream
            .wait_for_timeout(WAIT, DiscoveryState::is_discovering)
            .await
            .unwrap();
        wait_for_calls(&strategy, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(strategy.calls(), 1);

        strategy.resolve(Ok(vec![9]));
        let state = stream
            .wait_for_timeout(WAIT, |s| matches!(s, State::Discovered(_)))
            .await
            .unwrap();
        assert_eq!(state, State::Discovered(vec![9]));
        assert_eq!(strategy.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_preserves_previous_values() {
        let (machine, strategy) = machine();
        let mut stream = machine.subscribe();

        machine.discover();
        wait_for_calls(&strategy, 1).await;
        strategy.resolve(Ok(vec![1, 2]));
        stream
            .wait_for_timeout(WAIT, |s| matches!(s, State::Discovered(_)))
            .await
            .unwrap();

        machine.discover();
        assert_eq!(
            stream.next().await,
            Some(State::Discovering(Some(vec![1, 2])))
        );
        wait_for_calls(&strategy, 2).await;
        strategy.resolve(Err("boom".to_string()));

        let state = stream
            .wait_for_timeout(WAIT, |s| s.error().is_some())
            .await
            .unwrap();
        assert_eq!(
            state,
            State::DiscoveryFailed("boom".to_string(), Some(vec![1, 2]))
        );
        assert_eq!(state.values(), Some(&[1, 2][..]));
    }

    #[tokio::test]
    async fn test_retry_after_failure_carries_values_forward() {
        let (machine, strategy) = machine();
        let mut stream = machine.subscribe();

        machine.discover();
        wait_for_calls(&strategy, 1).await;
        strategy.resolve(Err("first".to_string()));
        stream
            .wait_for_timeout(WAIT, |s| s.error().is_some())
            .await
            .unwrap();
        assert_eq!(machine.state(), State::DiscoveryFailed("first".to_string(), None));

        machine.discover();
        assert_eq!(stream.next().await, Some(State::Discovering(None)));
    }

    #[tokio::test]
    async fn test_reset_drops_stale_result() {
        let (machine, strategy) = machine();
        let mut stream = machine.subscribe();

        machine.discover();
        stream
            .wait_for_timeout(WAIT, DiscoveryState::is_discovering)
            .await
            .unwrap();
        wait_for_calls(&strategy, 1).await;

        machine.reset();
        stream
            .wait_for_timeout(WAIT, |s| *s == State::NotDiscoveredYet)
            .await
            .unwrap();

        strategy.resolve(Ok(vec![42]));
        let late = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(late.is_err(), "stale result was published: {:?}", late);
        assert_eq!(machine.state(), State::NotDiscoveredYet);
    }

    #[tokio::test]
    async fn test_superseded_round_does_not_complete_new_round() {
        let (machine, strategy) = machine();
        let mut stream = machine.subscribe();

        machine.discover();
        wait_for_calls(&strategy, 1).await;
        machine.reset();
        machine.discover();
        wait_for_calls(&strategy, 2).await;

        // First round finishes late and must be ignored
        strategy.resolve(Ok(vec![1]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(machine.state().is_discovering());

        strategy.resolve(Ok(vec![2]));
        let state = stream
            .wait_for_timeout(WAIT, |s| matches!(s, State::Discovered(_)))
            .await
            .unwrap();
        assert_eq!(state, State::Discovered(vec![2]));
    }

    #[tokio::test]
    async fn test_fn_strategy() {
        let machine: DiscoveryStateMachine<&'static str, String> = DiscoveryStateMachine::new(
            "fn",
            Arc::new(FnStrategy::new(|| async { Ok::<_, String>(vec!["a", "b"]) })),
            EngineConfig::default(),
        );
        let mut stream = machine.subscribe();
        machine.discover();

        let state = stream
            .wait_for_timeout(WAIT, |s| matches!(s, DiscoveryState::Discovered(_)))
            .await
            .unwrap();
        assert_eq!(state.values(), Some(&["a", "b"][..]));
    }

    #[test]
    fn test_state_accessors() {
        let state: State = DiscoveryState::default();
        assert_eq!(state, State::NotDiscoveredYet);
        assert!(state.values().is_none());
        assert!(!state.is_discovering());
        assert!(State::Discovering(Some(vec![1])).is_discovering());
        assert_eq!(State::Discovering(Some(vec![1])).values(), Some(&[1][..]));
    }
}
