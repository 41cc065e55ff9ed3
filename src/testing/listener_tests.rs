//! Listener registration, failover and reconnect scenarios against a
//! simulated cluster.
//!
//! These tests cover:
//! - Registration retries across nodes
//! - Failover of only the listeners bound to failed servers
//! - The fixed-period reconnect loop (paused clock)
//! - Abandoning listeners on permanent failures and after shutdown

#[cfg(test)]
mod tests {
    use crate::client::{RemoteClient, ServerEvent};
    use crate::config::{ClientConfig, ListenerConfig};
    use crate::error::{Error, TransportError};
    use crate::listener::{
        ChannelListener, ClientEvent, FailoverOutcome, ListenerNotification, ListenerOptions,
    };
    use crate::testing::{init_tracing, node_addr, wait_for, SimulatedCluster};
    use crate::types::{Address, ListenerId, SegmentSet};
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const PERIOD: Duration = Duration::from_millis(5000);

    fn client_with(cluster: &Arc<SimulatedCluster>, listener: ListenerConfig) -> RemoteClient {
        init_tracing();
        RemoteClient::new(
            ClientConfig::default().with_listener_config(listener),
            cluster.clone(),
            cluster.clone(),
            Arc::new(cluster.ownership()),
        )
        .expect("valid config")
    }

    fn client(cluster: &Arc<SimulatedCluster>) -> RemoteClient {
        client_with(cluster, ListenerConfig::default())
    }

    async fn add_listener(
        client: &RemoteClient,
    ) -> (ListenerId, mpsc::UnboundedReceiver<ListenerNotification>) {
        let (listener, rx) = ChannelListener::new();
        let id = client
            .add_listener("c", Arc::new(listener), ListenerOptions::default())
            .await
            .expect("listener registered");
        (id, rx)
    }

    fn created(key: &'static [u8]) -> ClientEvent {
        ClientEvent::Created {
            key: Bytes::from_static(key),
            version: 1,
            command_retried: false,
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================
    #[tokio::test]
    async fn registration_retries_on_another_node() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 3));
        cluster.fail_registrations(1);
        let client = client(&cluster);

        let (id, _rx) = add_listener(&client).await;

        assert_eq!(cluster.registration_attempts(), 2);
        assert_eq!(client.listener_address(&id), Some(node_addr(1)));
        assert!(cluster.has_listener(node_addr(1), &id));
        assert!(client.is_listener_connected(&id));
    }

    #[tokio::test]
    async fn registration_gives_up_after_max_retries() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 3));
        cluster.fail_registrations(10);
        let client = client_with(
            &cluster,
            ListenerConfig::default().with_max_registration_retries(1),
        );

        let (listener, _rx) = ChannelListener::new();
        let result = client
            .add_listener("c", Arc::new(listener), ListenerOptions::default())
            .await;

        match result {
            Err(Error::Transport(TransportError::ConnectionFailed { addr, .. })) => {
                assert_eq!(addr, node_addr(1));
            }
            other => panic!("expected connection failure, got {:?}", other),
        }
        assert_eq!(cluster.registration_attempts(), 2);
        assert!(client.listeners_for_cache("c").is_empty());
    }

    #[tokio::test]
    async fn events_reach_the_application() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 1));
        let client = client(&cluster);
        let (id, mut rx) = add_listener(&client).await;

        client.listeners().invoke_event(&id, created(b"k1")).unwrap();
        client.listeners().invoke_event(&id, created(b"k2")).unwrap();

        assert_eq!(rx.recv().await, Some(ListenerNotification::Event(created(b"k1"))));
        assert_eq!(rx.recv().await, Some(ListenerNotification::Event(created(b"k2"))));
    }

    // ========================================================================
    // Failover targeting
    // ========================================================================
    #[tokio::test]
    async fn failover_only_touches_listeners_of_failed_server() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 2));
        let client = client(&cluster);

        let (on_first, mut first_rx) = add_listener(&client).await;
        assert_eq!(client.listener_address(&on_first), Some(node_addr(0)));

        // Bind the second listener to the other node.
        cluster.kill_node(node_addr(0));
        let (on_second, mut second_rx) = add_listener(&client).await;
        assert_eq!(client.listener_address(&on_second), Some(node_addr(1)));
        let untouched = client.listeners().dispatcher(&on_second).unwrap();

        let affected = client.handle_server_event(ServerEvent::ServerFailed { addr: node_addr(0) });
        assert_eq!(affected, vec![on_first.clone()]);

        assert_eq!(first_rx.recv().await, Some(ListenerNotification::Failover));
        assert!(
            wait_for(
                || client.listener_address(&on_first) == Some(node_addr(1)),
                TIMEOUT
            )
            .await
        );
        assert!(client.is_listener_connected(&on_first));

        let current = client.listeners().dispatcher(&on_second).unwrap();
        assert!(Arc::ptr_eq(&current, &untouched));
        assert!(current.is_running());
        assert!(second_rx.try_recv().is_err());

        // The re-registered listener keeps receiving events.
        client.listeners().invoke_event(&on_first, created(b"k")).unwrap();
        assert_eq!(first_rx.recv().await, Some(ListenerNotification::Event(created(b"k"))));
    }

    #[tokio::test]
    async fn failover_stops_old_dispatcher_once() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 2));
        let client = client(&cluster);
        let (id, _rx) = add_listener(&client).await;
        let old = client.listeners().dispatcher(&id).unwrap();

        cluster.kill_node(node_addr(0));
        let outcome = client.listeners().failover_client_listener(&id).await;

        assert_eq!(outcome, FailoverOutcome::Reconnected(node_addr(1)));
        assert!(!old.is_running());
        assert!(!old.stop());
        assert_eq!(cluster.released_listeners(), vec![id.clone()]);

        let new = client.listeners().dispatcher(&id).unwrap();
        assert!(!Arc::ptr_eq(&new, &old));
        assert_eq!(client.metrics().listener_failovers, 1);
    }

    #[tokio::test]
    async fn failover_of_unknown_listener_is_ignored() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 1));
        let client = client(&cluster);

        let outcome = client
            .listeners()
            .failover_client_listener(&ListenerId::from_static(b"missing"))
            .await;
        assert_eq!(outcome, FailoverOutcome::NotFound);

        let failed: HashSet<Address> = HashSet::from([node_addr(0)]);
        assert!(client.listeners().failover_listeners(&failed).is_empty());
    }

    // ========================================================================
    // Reconnect loop
    // ========================================================================
    #[tokio::test(start_paused = true)]
    async fn reconnect_runs_every_period_until_registered() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 1));
        let client = client(&cluster);
        let (id, mut rx) = add_listener(&client).await;
        assert_eq!(cluster.registration_attempts(), 1);

        cluster.kill_node(node_addr(0));
        let outcome = client.listeners().failover_client_listener(&id).await;
        assert_eq!(outcome, FailoverOutcome::ReconnectScheduled);
        assert_eq!(rx.recv().await, Some(ListenerNotification::Failover));
        assert_eq!(cluster.registration_attempts(), 2);
        assert!(!client.is_listener_connected(&id));

        tokio::time::sleep(PERIOD - Duration::from_millis(1)).await;
        assert_eq!(cluster.registration_attempts(), 2);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(cluster.registration_attempts(), 3);

        tokio::time::sleep(PERIOD).await;
        assert_eq!(cluster.registration_attempts(), 4);
        assert!(client.listeners().is_reconnect_scheduled(&id));

        cluster.revive_node(node_addr(0));
        tokio::time::sleep(PERIOD).await;
        assert_eq!(cluster.registration_attempts(), 5);
        assert!(client.is_listener_connected(&id));
        assert_eq!(client.listener_address(&id), Some(node_addr(0)));
        assert!(!client.listeners().is_reconnect_scheduled(&id));

        tokio::time::sleep(PERIOD * 4).await;
        assert_eq!(cluster.registration_attempts(), 5);

        let metrics = client.metrics();
        assert_eq!(metrics.reconnect_attempts, 3);
        assert_eq!(metrics.pending_reconnects, 0);
        assert_eq!(metrics.listeners_abandoned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_listener_cancels_reconnect() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 1));
        let client = client(&cluster);
        let (id, _rx) = add_listener(&client).await;

        cluster.kill_node(node_addr(0));
        assert_eq!(
            client.listeners().failover_client_listener(&id).await,
            FailoverOutcome::ReconnectScheduled
        );
        assert!(client.remove_listener(&id).await);
        assert!(!client.listeners().is_reconnect_scheduled(&id));

        let attempts = cluster.registration_attempts();
        cluster.revive_node(node_addr(0));
        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(cluster.registration_attempts(), attempts);
        assert!(!client.is_listener_connected(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn readding_listener_waits_for_pending_reconnect_to_be_removed() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 1));
        let client = client(&cluster);
        let id = ListenerId::from_static(b"L");
        let (listener, _rx) = ChannelListener::new();
        let listener = Arc::new(listener);
        client
            .listeners()
            .add_client_listener_with_id(id.clone(), "c", listener.clone(), ListenerOptions::default())
            .await
            .unwrap();

        cluster.kill_node(node_addr(0));
        assert_eq!(
            client.listeners().failover_client_listener(&id).await,
            FailoverOutcome::ReconnectScheduled
        );
        cluster.add_node(node_addr(1), SegmentSet::new());

        // Still owned by the reconnect loop.
        let result = client
            .listeners()
            .add_client_listener_with_id(id.clone(), "c", listener.clone(), ListenerOptions::default())
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(client.listeners().is_reconnect_scheduled(&id));

        assert!(client.remove_listener(&id).await);
        let addr = client
            .listeners()
            .add_client_listener_with_id(id.clone(), "c", listener, ListenerOptions::default())
            .await
            .unwrap();
        assert_eq!(addr, node_addr(1));
        let readded = client.listeners().dispatcher(&id).unwrap();

        tokio::time::sleep(PERIOD * 2 + Duration::from_millis(1)).await;

        let current = client.listeners().dispatcher(&id).unwrap();
        assert!(Arc::ptr_eq(&current, &readded));
        assert!(current.is_running());
        assert!(!client.listeners().is_reconnect_scheduled(&id));
        assert_eq!(client.listeners().len(), 1);
        assert_eq!(cluster.released_listeners(), vec![id.clone()]);
        assert!(cluster.has_listener(node_addr(1), &id));
    }

    // ========================================================================
    // Abandoned listeners
    // ========================================================================
    #[tokio::test]
    async fn permanent_registration_failure_abandons_listener() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 2));
        let client = client(&cluster);
        let (id, mut rx) = add_listener(&client).await;

        cluster.fail_registrations_permanently();
        cluster.kill_node(node_addr(0));
        let outcome = client.listeners().failover_client_listener(&id).await;

        assert_eq!(outcome, FailoverOutcome::Abandoned);
        assert_eq!(rx.recv().await, Some(ListenerNotification::Failover));
        assert!(!client.is_listener_connected(&id));
        assert!(!client.listeners().is_reconnect_scheduled(&id));
        assert_eq!(client.metrics().listeners_abandoned, 1);
    }

    #[tokio::test]
    async fn failover_after_shutdown_abandons_listener() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 2));
        let client = client(&cluster);
        let (id, _rx) = add_listener(&client).await;
        let attempts = cluster.registration_attempts();

        client.listeners().shutdown();
        let outcome = client.listeners().failover_client_listener(&id).await;

        assert_eq!(outcome, FailoverOutcome::Abandoned);
        assert_eq!(cluster.registration_attempts(), attempts);
        assert_eq!(client.metrics().listeners_abandoned, 1);
    }

    #[tokio::test]
    async fn client_shutdown_stops_every_listener() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(4, 2));
        let client = client(&cluster);
        let (first, _first_rx) = add_listener(&client).await;
        let (second, _second_rx) = add_listener(&client).await;
        assert_eq!(client.listeners_for_cache("c").len(), 2);

        client.shutdown();

        assert!(!client.is_listener_connected(&first));
        assert!(!client.is_listener_connected(&second));
        assert!(client.listeners().is_empty());
        assert_eq!(cluster.released_listeners().len(), 2);
        assert_eq!(client.metrics().active_listeners, 0);
    }
}
