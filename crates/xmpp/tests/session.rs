//! End-to-end session tests against a scripted loopback server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use common::{
    BIND_FEATURES, DOMAIN, TestServer, TestTlsCredentials, configuration, init_test, mechanisms,
    wait_for_state,
};
use skua_xmpp::modules::StreamManagementModule;
use skua_xmpp::{
    AuthError, ClientDisconnectReason, ClientState, Context, Criteria, ModuleIdentifier,
    SaslCause, SessionLogic, Stanza, XmppError, XmppModule,
};

#[tokio::test]
async fn plain_login_binds_a_resource() {
    init_test();
    let server = TestServer::start().await;
    let session = SessionLogic::new(configuration(server.endpoint()));
    session.start();

    let mut connection = server.accept().await;
    let header = connection.open_stream(&mechanisms(&["SCRAM-SHA-1-PLUS", "PLAIN"])).await;
    // no TLS, so the account stays anonymous
    assert_eq!(header.from, None);
    connection.sasl_plain().await;
    connection.open_stream(BIND_FEATURES).await;
    connection.bind("test").await;

    let state = wait_for_state(&session, ClientState::is_connected).await;
    assert_matches!(state, ClientState::Connected { resumed: false });
    assert_eq!(
        session.context().bound_jid().map(|jid| jid.to_string()),
        Some(format!("user@{DOMAIN}/test"))
    );

    let stop = tokio::spawn(async move { connection.expect_close().await });
    session.stop(false).await;
    stop.await.unwrap();
    assert_matches!(
        session.state(),
        ClientState::Disconnected(ClientDisconnectReason::None)
    );
    assert!(session.context().bound_jid().is_none());
}

#[tokio::test]
async fn starttls_comes_before_authentication() {
    init_test();
    let tls = TestTlsCredentials::generate();
    let server = TestServer::start().await;
    let mut config = configuration(server.endpoint());
    config.connector.tls_config = Some(tls.client_config());
    let session = SessionLogic::new(config);
    session.start();

    let mut connection = server.accept().await;
    connection
        .open_stream(&format!(
            "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>{}",
            mechanisms(&["PLAIN"])
        ))
        .await;
    connection.starttls(&tls.acceptor()).await;

    let header = connection.open_stream(&mechanisms(&["PLAIN"])).await;
    assert_eq!(header.from.as_deref(), Some("user@example.com"));
    connection.sasl_plain().await;
    connection.open_stream(BIND_FEATURES).await;
    connection.bind("secure").await;

    wait_for_state(&session, ClientState::is_connected).await;
    assert!(session.context().connector().is_tls_active());
}

#[tokio::test]
async fn rejected_credentials_surface_as_authentication_failure() {
    init_test();
    let server = TestServer::start().await;
    let session = SessionLogic::new(configuration(server.endpoint()));
    session.start();

    let mut connection = server.accept().await;
    connection.open_stream(&mechanisms(&["PLAIN"])).await;
    connection.expect().await;
    connection
        .send("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>")
        .await;
    connection.expect_close().await;

    let state = wait_for_state(&session, ClientState::is_disconnected).await;
    let ClientState::Disconnected(ClientDisconnectReason::AuthenticationFailure(error)) = state
    else {
        panic!("expected authentication failure, got {state:?}");
    };
    assert_eq!(error.sasl_cause(), Some(SaslCause::NotAuthorized));
    assert_matches!(error, AuthError::Sasl(_));
}

#[tokio::test]
async fn see_other_host_reconnects_without_disconnecting() {
    init_test();
    let first = TestServer::start().await;
    let second = TestServer::start().await;
    let session = SessionLogic::new(configuration(first.endpoint()));

    let observed = Arc::new(Mutex::new(Vec::new()));
    let mut states = session.subscribe_state();
    tokio::spawn({
        let observed = observed.clone();
        async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                observed.lock().unwrap().push(state);
            }
        }
    });
    session.start();

    let mut redirected = first.accept().await;
    redirected.expect_header().await;
    redirected
        .send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' id='r1' from='{DOMAIN}' version='1.0'>\
             <stream:error><see-other-host xmlns='urn:ietf:params:xml:ns:xmpp-streams'>127.0.0.1:{}</see-other-host></stream:error>\
             </stream:stream>",
            second.addr().port()
        ))
        .await;

    let mut connection = second.accept().await;
    connection.login().await;
    wait_for_state(&session, ClientState::is_connected).await;

    let observed = observed.lock().unwrap();
    assert!(
        !observed.iter().any(ClientState::is_disconnected),
        "redirect leaked a disconnect: {observed:?}"
    );
}

/// Records message ids and how many handlers ran at once.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ModuleIdentifier for Recorder {
    const ID: &'static str = "recorder";
}

#[async_trait]
impl XmppModule for Recorder {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::name("message").xmlns("jabber:client"))
    }

    async fn process(&self, _ctx: &Arc<Context>, stanza: Stanza) -> Result<(), XmppError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        // the first handler is the slowest
        if stanza.id() == Some("m1") {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.seen
            .lock()
            .unwrap()
            .push(stanza.id().unwrap_or_default().to_string());
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn stanzas_reach_modules_one_at_a_time_in_order() {
    init_test();
    let server = TestServer::start().await;
    let session = SessionLogic::new(configuration(server.endpoint()));
    let recorder = session
        .context()
        .modules()
        .register(Arc::new(Recorder::default()));
    session.start();

    let mut connection = server.accept().await;
    connection.login().await;
    wait_for_state(&session, ClientState::is_connected).await;

    connection
        .send(
            "<message xmlns='jabber:client' id='m1' from='peer@example.com/a'><body>1</body></message>\
             <message xmlns='jabber:client' id='m2' from='peer@example.com/a'><body>2</body></message>\
             <message xmlns='jabber:client' id='m3' from='peer@example.com/a'><body>3</body></message>",
        )
        .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.seen.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all messages processed");

    assert_eq!(*recorder.seen.lock().unwrap(), vec!["m1", "m2", "m3"]);
    assert_eq!(recorder.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_iq_responses_are_dropped() {
    init_test();
    let server = TestServer::start().await;
    let session = Arc::new(SessionLogic::new(configuration(server.endpoint())));
    session.start();

    let mut connection = server.accept().await;
    connection.login().await;
    wait_for_state(&session, ClientState::is_connected).await;

    let request = tokio::spawn({
        let session = session.clone();
        async move {
            let mut iq = Stanza::iq(
                skua_xmpp::StanzaType::Get,
                Some(minidom::Element::builder("query", "jabber:iq:version").build()),
            );
            iq.set_id("v1");
            session.send_iq(iq).await
        }
    });

    let sent = connection.expect().await;
    assert_eq!(sent.attr("id"), Some("v1"));
    let reply = "<iq xmlns='jabber:client' type='result' id='v1'><query xmlns='jabber:iq:version'/></iq>";
    connection.send(reply).await;
    connection.send(reply).await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.id(), Some("v1"));

    // the duplicate got neither a second delivery nor an error reply
    session.send(Stanza::presence()).await.unwrap();
    assert_eq!(connection.expect().await.name(), "presence");
}

#[tokio::test]
async fn sasl2_binds_inline_without_stream_restart() {
    init_test();
    let server = TestServer::start().await;
    let session = SessionLogic::new(configuration(server.endpoint()));
    session.start();

    let mut connection = server.accept().await;
    connection
        .open_stream(
            "<authentication xmlns='urn:xmpp:sasl:2'><mechanism>PLAIN</mechanism>\
             <inline><bind xmlns='urn:xmpp:bind:0'/></inline></authentication>",
        )
        .await;

    let authenticate = connection.expect().await;
    assert!(authenticate.is("authenticate", "urn:xmpp:sasl:2"));
    assert_eq!(authenticate.attr("mechanism"), Some("PLAIN"));
    assert!(authenticate.get_child("bind", "urn:xmpp:bind:0").is_some());
    connection
        .send(&format!(
            "<success xmlns='urn:xmpp:sasl:2'>\
             <authorization-identifier>user@{DOMAIN}/inline</authorization-identifier>\
             <bound xmlns='urn:xmpp:bind:0'/></success>"
        ))
        .await;

    let state = wait_for_state(&session, ClientState::is_connected).await;
    assert_matches!(state, ClientState::Connected { resumed: false });
    assert_eq!(
        session.context().bound_jid().map(|jid| jid.to_string()),
        Some(format!("user@{DOMAIN}/inline"))
    );
}

#[tokio::test]
async fn lost_connection_resumes_the_session() {
    init_test();
    let server = TestServer::start().await;
    let session = SessionLogic::new(configuration(server.endpoint()));
    session.start();

    let mut connection = server.accept().await;
    connection.open_stream(&mechanisms(&["PLAIN"])).await;
    connection.sasl_plain().await;
    connection
        .open_stream(&format!("{BIND_FEATURES}<sm xmlns='urn:xmpp:sm:3'/>"))
        .await;
    connection.bind("phone").await;
    let enable = connection.expect().await;
    assert!(enable.is("enable", "urn:xmpp:sm:3"));
    assert_eq!(enable.attr("resume"), Some("true"));
    connection
        .send("<enabled xmlns='urn:xmpp:sm:3' id='sm-1' resume='true'/>")
        .await;
    wait_for_state(&session, ClientState::is_connected).await;

    drop(connection);
    wait_for_state(&session, ClientState::is_disconnected).await;
    let sm = session.context().module::<StreamManagementModule>();
    assert!(sm.is_resumption_enabled());

    session.start();
    let mut connection = server.accept().await;
    connection.open_stream(&mechanisms(&["PLAIN"])).await;
    connection.sasl_plain().await;
    connection
        .open_stream(&format!("{BIND_FEATURES}<sm xmlns='urn:xmpp:sm:3'/>"))
        .await;
    let resume = connection.expect().await;
    assert!(resume.is("resume", "urn:xmpp:sm:3"));
    assert_eq!(resume.attr("previd"), Some("sm-1"));
    connection
        .send("<resumed xmlns='urn:xmpp:sm:3' previd='sm-1' h='0'/>")
        .await;

    let state = wait_for_state(&session, ClientState::is_connected).await;
    assert_matches!(state, ClientState::Connected { resumed: true });
    assert_eq!(
        session.context().bound_jid().map(|jid| jid.to_string()),
        Some(format!("user@{DOMAIN}/phone"))
    );
}
