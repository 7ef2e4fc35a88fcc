//! Routing redirects, failover partners and the partner rules.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use mssql_connect::{
    ApplicationIntent, Config, Connection, ConnectionOrchestrator, ConnectionShared, DataSource,
    ErrorKind, LoginState, PoolGroupContext,
};
use mssql_testing::{MockConnector, MockLogin, tokens};
use tds_protocol::FeatureId;

fn failover_config() -> Config {
    Config::new()
        .host("primary")
        .failover_partner(DataSource::new("mirror"))
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_routing_is_followed() {
    let connector = Arc::new(
        MockConnector::new()
            .then(MockLogin::respond(vec![
                tokens::routing("replica.example.net", 11000, Some("sales")),
                tokens::done(),
            ]))
            .on_host("replica.example.net", MockLogin::success()),
    );
    let journal = connector.journal();
    let config = Config::new().host("gateway.example.net").database("app");

    let conn = Connection::connect(config, connector).await.unwrap();

    assert_eq!(journal.hosts(), ["gateway.example.net", "replica.example.net"]);
    assert_eq!(journal.connects()[1].port, Some(11000));
    assert_eq!(journal.disconnects(), 1);

    let logins = journal.logins();
    assert_eq!(logins[0].database, "app");
    assert_eq!(logins[1].database, "sales");
    assert_eq!(logins[1].server_name, "replica.example.net,11000");

    let identity = conn.session().identity();
    assert!(identity.is_routed());
    assert_eq!(identity.pre_routing_name(), Some("gateway.example.net"));
    assert_eq!(conn.login_attempts().len(), 2);
    assert!(conn.login_attempts()[0].routed_to.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_eleventh_redirect_exceeds_limit() {
    let connector = Arc::new(MockConnector::new().otherwise(MockLogin::route_to("replica", 11000)));
    let journal = connector.journal();
    let shared = ConnectionShared::new();
    let mut orchestrator = ConnectionOrchestrator::new(Arc::new(Config::new()), connector, None);

    let err = orchestrator.login(&shared, None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RoutingLimitExceeded);
    assert_eq!(journal.connect_count(), 11);
    assert_eq!(orchestrator.routing_count(), 10);
    assert_eq!(orchestrator.state(), LoginState::FailedFatal);

    let history = orchestrator.history();
    assert!(history[..10].iter().all(|a| a.routed_to.is_some()));
    assert_eq!(history[10].error, Some(ErrorKind::RoutingLimitExceeded));
}

#[tokio::test(start_paused = true)]
async fn test_redirects_refused_when_not_following() {
    let connector = Arc::new(MockConnector::new().otherwise(MockLogin::route_to("replica", 11000)));
    let journal = connector.journal();
    let config = Config::new().redirect(mssql_connect::RedirectConfig::no_follow());

    let err = Connection::connect(config, connector).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RoutingLimitExceeded);
    assert_eq!(journal.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_routing_rejected_before_connecting() {
    for record in [
        tokens::routing_with_protocol(1, "replica", 11000, None),
        tokens::routing("replica", 0, None),
        tokens::routing("", 11000, None),
    ] {
        let connector = Arc::new(
            MockConnector::new()
                .then(MockLogin::respond(vec![record, tokens::done()]))
                .otherwise(MockLogin::success()),
        );
        let journal = connector.journal();
        let shared = ConnectionShared::new();
        let mut orchestrator =
            ConnectionOrchestrator::new(Arc::new(Config::new()), connector, None);

        let err = orchestrator.login(&shared, None).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidRoutingInfo);
        assert_eq!(journal.connect_count(), 1);
        assert!(shared.is_doomed());
    }
}

// =============================================================================
// Failover
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failover_partner_takes_over() {
    let pool = PoolGroupContext::new();
    let connector = Arc::new(
        MockConnector::new()
            .on_host("mirror", MockLogin::success_with(vec![tokens::failover_partner("primary")])),
    );
    let journal = connector.journal();

    let conn = Connection::connect_pooled(failover_config(), connector, Arc::clone(&pool))
        .await
        .unwrap();

    assert_eq!(journal.hosts(), ["primary", "mirror"]);
    assert_eq!(conn.session().failover_partner(), Some("primary"));
    assert!(pool.prefer_failover());

    // The next connection of the group starts on the partner.
    let connector = Arc::new(
        MockConnector::new()
            .on_host("mirror", MockLogin::success_with(vec![tokens::failover_partner("primary")])),
    );
    let journal = connector.journal();
    Connection::connect_pooled(failover_config(), connector, Arc::clone(&pool))
        .await
        .unwrap();
    assert_eq!(journal.hosts(), ["mirror"]);
}

#[tokio::test(start_paused = true)]
async fn test_failover_slices_grow_per_pair() {
    let connector = Arc::new(MockConnector::new().otherwise(MockLogin::Hang));
    let journal = connector.journal();
    let config = failover_config().connect_timeout(Duration::from_secs(15));

    let started = tokio::time::Instant::now();
    let err = Connection::connect(config, connector).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimeoutExpired);

    let timeouts: Vec<u64> = journal
        .connects()
        .iter()
        .map(|c| c.timeout.unwrap().as_millis() as u64)
        .collect();
    assert_eq!(timeouts, [1200, 1200, 2400, 2400, 3600, 3600]);
    assert_eq!(
        journal.hosts(),
        ["primary", "mirror", "primary", "mirror", "primary", "mirror"]
    );
    // Six slices plus the 100 and 200 ms sleeps between pairs.
    assert_eq!(started.elapsed(), Duration::from_millis(14_700));
}

#[tokio::test(start_paused = true)]
async fn test_failover_host_must_report_partner() {
    let connector = Arc::new(MockConnector::new().on_host("mirror", MockLogin::success()));

    let err = Connection::connect(failover_config(), connector).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPartnerConfiguration);
}

#[tokio::test(start_paused = true)]
async fn test_server_partner_switches_to_failover() {
    let pool = PoolGroupContext::new();
    let connector = Arc::new(
        MockConnector::new()
            .then(MockLogin::respond(vec![
                tokens::failover_partner("mirror"),
                tokens::error(40613, 14, "Database 'app' is not currently available."),
                tokens::done_error(),
            ]))
            .on_host("mirror", MockLogin::success_with(vec![tokens::failover_partner("primary")])),
    );
    let journal = connector.journal();
    let config = Config::new().host("primary");

    Connection::connect_pooled(config, connector, Arc::clone(&pool))
        .await
        .unwrap();

    assert_eq!(journal.hosts(), ["primary", "mirror"]);
    assert!(pool.prefer_failover());
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_stops_failover() {
    let connector = Arc::new(
        MockConnector::new()
            .then(MockLogin::server_error(18456, 14, "Login failed for user 'app'."))
            .otherwise(MockLogin::success_with(vec![tokens::failover_partner("primary")])),
    );
    let journal = connector.journal();

    let err = Connection::connect(failover_config(), connector).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    assert_eq!(journal.hosts(), ["primary"]);
}

// =============================================================================
// Partner rules
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_read_only_intent_requires_read_only_failover() {
    let connector = Arc::new(
        MockConnector::new().then(MockLogin::success_with(vec![tokens::failover_partner("mirror")])),
    );
    let config = Config::new().application_intent(ApplicationIntent::ReadOnly);

    let err = Connection::connect(config.clone(), connector).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPartnerConfiguration);

    let connector = Arc::new(MockConnector::new().then(MockLogin::success_with(vec![
        tokens::failover_partner("mirror"),
        tokens::feature_ext_ack(&[(FeatureId::AzureSqlSupport as u8, &[0x01])]),
    ])));
    let journal = connector.journal();

    let conn = Connection::connect(config, connector).await.unwrap();
    assert!(conn.session().capabilities().read_only_failover_supported());
    assert!(journal.logins()[0].read_only_intent);
}

#[tokio::test(start_paused = true)]
async fn test_multi_subnet_rejects_server_partner() {
    let connector = Arc::new(
        MockConnector::new().then(MockLogin::success_with(vec![tokens::failover_partner("mirror")])),
    );
    let config = Config::new().multi_subnet_failover(true);

    let err = Connection::connect(config, connector).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPartnerConfiguration);
}

#[tokio::test(start_paused = true)]
async fn test_multi_subnet_attempt_timeouts() {
    let connector = Arc::new(MockConnector::new().then(MockLogin::Hang).then(MockLogin::success()));
    let journal = connector.journal();
    let config = Config::new()
        .multi_subnet_failover(true)
        .connect_timeout(Duration::from_secs(10));

    Connection::connect(config, connector).await.unwrap();

    let timeouts: Vec<_> = journal.connects().iter().map(|c| c.timeout).collect();
    assert_eq!(
        timeouts,
        [Some(Duration::from_millis(800)), Some(Duration::from_millis(1600))]
    );
}
