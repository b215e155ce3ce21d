/*!
 * Wiring shared by the entity models.
 *
 * Model state is derived from the streams of the machines a model owns.
 * Derivation is a combine-latest: recomputed on every constituent update
 * and published only when it changed. A second helper mirrors a finished
 * discovery into the model's child registry, replacing the children
 * wholesale on every new result.
 */
use std::fmt::Debug;

use tracing::debug;

use blueflow_core::state::{StatePublisher, StateStream};
use blueflow_core::utils::spawn_actor;
use blueflow_engine::connectable::ConnectableDiscoveryState;
use blueflow_engine::discovery::DiscoveryState;
use blueflow_engine::registry::{Entity, EntityRegistry};

/// Keep `target` equal to `derive` applied to the latest value of `source`
pub(crate) fn map_latest<A, S, F>(
    name: &str,
    id: &str,
    mut source: StateStream<A>,
    target: StatePublisher<S>,
    derive: F,
) where
    A: Clone + Debug + Send + 'static,
    S: Clone + Debug + PartialEq + Send + 'static,
    F: Fn(&A) -> S + Send + 'static,
{
    spawn_actor(name, Some(id), async move {
        while let Some(value) = source.next().await {
            target.publish_if_changed(derive(&value));
        }
    });
}

/// Keep `target` equal to `combine` applied to the latest values of both streams
pub(crate) fn combine_latest<A, B, S, F>(
    name: &str,
    id: &str,
    mut first: StateStream<A>,
    mut second: StateStream<B>,
    target: StatePublisher<S>,
    combine: F,
) where
    A: Clone + Debug + Send + 'static,
    B: Clone + Debug + Send + 'static,
    S: Clone + Debug + PartialEq + Send + 'static,
    F: Fn(&A, &B) -> S + Send + 'static,
{
    spawn_actor(name, Some(id), async move {
        let (Some(mut a), Some(mut b)) = (first.next().await, second.next().await) else {
            return;
        };
        target.publish_if_changed(combine(&a, &b));

        loop {
            tokio::select! {
                next = first.next() => match next {
                    Some(value) => a = value,
                    None => break,
                },
                next = second.next() => match next {
                    Some(value) => b = value,
                    None => break,
                },
            }
            target.publish_if_changed(combine(&a, &b));
        }
    });
}

/// Mirror each discovery result of `source` into `registry`
///
/// `Discovered` replaces the registry contents, `NotDiscoveredYet` clears
/// them. In-flight and failed rounds leave the last children in place.
pub(crate) fn mirror_children<M, E>(
    name: &str,
    id: &str,
    mut source: StateStream<ConnectableDiscoveryState<M, E>>,
    registry: EntityRegistry<M>,
) where
    M: Entity + PartialEq,
    E: Clone + Debug + Send + Sync + 'static,
{
    let label = id.to_string();
    spawn_actor(name, Some(id), async move {
        let mut applied: Vec<M> = Vec::new();

        while let Some(state) = source.next().await {
            let children = match state.discovery {
                DiscoveryState::Discovered(children) => children,
                DiscoveryState::NotDiscoveredYet => Vec::new(),
                _ => continue,
            };
            if children != applied {
                debug!("Replacing {} children of {}", children.len(), label);
                registry.replace_all(children.iter().cloned());
                applied = children;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_combine_latest() {
        let left = StatePublisher::new(1u32);
        let right = StatePublisher::new(10u32);
        let target = StatePublisher::new(0u32);

        combine_latest(
            "sum",
            "test",
            left.subscribe(),
            right.subscribe(),
            target.clone(),
            |a, b| a + b,
        );

        let mut stream = target.subscribe();
        stream.wait_for_timeout(WAIT, |s| *s == 11).await.unwrap();

        right.publish(20);
        stream.wait_for_timeout(WAIT, |s| *s == 21).await.unwrap();
        left.publish(2);
        stream.wait_for_timeout(WAIT, |s| *s == 22).await.unwrap();
    }

    #[tokio::test]
    async fn test_map_latest() {
        let source = StatePublisher::new("a".to_string());
        let target = StatePublisher::new(0usize);
        map_latest("len", "test", source.subscribe(), target.clone(), |s| s.len());

        source.publish("abc".to_string());
        target
            .subscribe()
            .wait_for_timeout(WAIT, |len| *len == 3)
            .await
            .unwrap();
    }
}
