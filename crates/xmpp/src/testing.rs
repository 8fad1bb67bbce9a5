//! Loopback server for module tests.

use std::sync::{Arc, Weak};
use std::time::Duration;

use jid::BareJid;
use minidom::Element;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::{ConnectionConfiguration, ConnectorOptions, Credentials};
use crate::connector::dns::ServerEndpoint;
use crate::connector::framing::{Frame, Framer};
use crate::connector::{Connector, ConnectorEvent, ConnectorState};
use crate::context::{ClientState, Context};
use crate::modules::StreamManagementModule;

pub(crate) struct MockServer {
    socket: TcpStream,
    framer: Framer,
}

impl MockServer {
    /// Next element written by the client, skipping stream headers.
    pub async fn expect(&mut self) -> Element {
        let mut buf = [0u8; 4096];
        loop {
            match self.framer.next_frame().unwrap() {
                Some(Frame::Element(element)) => return element,
                Some(_) => continue,
                None => {}
            }
            let n = tokio::time::timeout(Duration::from_secs(5), self.socket.read(&mut buf))
                .await
                .expect("client wrote in time")
                .unwrap();
            assert!(n > 0, "client closed the connection");
            self.framer.feed(&buf[..n]);
        }
    }

    pub async fn send(&mut self, xml: &str) {
        self.socket.write_all(xml.as_bytes()).await.unwrap();
    }
}

/// A context whose connector is connected to a fresh [`MockServer`].
///
/// Inbound elements go to stream management and then to the response
/// manager, the way the session driver routes them before dispatch.
pub(crate) async fn connected_context(credentials: Credentials) -> (Arc<Context>, MockServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (connector, mut events) = Connector::new(ConnectorOptions::default());
    let ctx = Arc::new(Context::new(
        ConnectionConfiguration::new(BareJid::new("user@example.com").unwrap(), credentials),
        connector.clone(),
    ));

    connector.start("example.com", Some(ServerEndpoint::new("127.0.0.1", port, false)));
    let (socket, _) = listener.accept().await.unwrap();
    connector
        .subscribe_state()
        .wait_for(|state| *state == ConnectorState::Connected)
        .await
        .unwrap();
    ctx.set_state(ClientState::Connecting);

    let weak: Weak<Context> = Arc::downgrade(&ctx);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let ConnectorEvent::Stanza(stanza) = event else {
                continue;
            };
            let Some(ctx) = weak.upgrade() else {
                break;
            };
            if let Some(sm) = ctx.module_or_none::<StreamManagementModule>() {
                if sm.process_incoming(&ctx, &stanza) {
                    continue;
                }
            }
            if let Some(continuation) = ctx.responses().continuation(&stanza, None) {
                continuation.resolve(stanza);
            }
        }
    });

    (
        ctx,
        MockServer {
            socket,
            framer: Framer::new(),
        },
    )
}
