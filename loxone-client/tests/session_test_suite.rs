use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use loxone_client::codec::ValueEvent;
use loxone_client::listener::{CommandResponseListener, Disposition, LoxoneEventListener};
use loxone_client::{Error, SessionState};
use loxone_types::LoxoneMessage;
use loxone_types::command::{Command, ResponseKind};

use crate::setup::MockMiniserver;


#[derive(Default)]
struct ResponseCollector {
    seen: Mutex<Vec<String>>,
}

impl ResponseCollector {
    fn contains(&self, control: &str) -> bool {
        self.seen.lock().iter().any(|seen| seen == control)
    }
}

impl CommandResponseListener for ResponseCollector {
    fn accepts(&self, kind: ResponseKind) -> bool {
        kind == ResponseKind::Message
    }

    fn on_command(&self, _command: &Command, message: &LoxoneMessage) -> Disposition {
        self.seen.lock().push(message.control.clone());
        Disposition::Accepted
    }
}

#[derive(Default)]
struct EventCollector {
    seen: Mutex<Vec<ValueEvent>>,
}

impl LoxoneEventListener for EventCollector {
    fn on_value_event(&self, event: &ValueEvent) {
        self.seen.lock().push(*event);
    }
}

async fn poll_until(what: &str, condition: impl Fn() -> bool) -> eyre::Result<()> {
    tokio::time::timeout(setup::WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| eyre::eyre!("timed out waiting for {what}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn simple_command_reaches_the_wire_and_comes_back() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);
    let collector = Arc::new(ResponseCollector::default());
    session.register_command_listener(collector.clone());

    session.send_command(Command::control("testCmd")).await?;
    server.wait_for_command("testCmd").await?;
    poll_until("response delivery", || collector.contains("testCmd")).await?;

    // the handshake preceded the command on the wire
    let commands = server.commands();
    let position = |needle: &str| {
        commands
            .iter()
            .position(|cmd| cmd.contains(needle))
            .unwrap_or(usize::MAX)
    };
    assert!(position("keyexchange") < position("getkey2"));
    assert!(position("getkey2") < position("gettoken"));
    assert!(position("gettoken") < position("testCmd"));
    assert_eq!(session.state(), SessionState::Ready);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_credentials_without_retries_surface_auth_timeout() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);
    session.set_retries(0);
    server.fail_next_tokens(u32::MAX);

    let err = session
        .send_command(Command::control("baf"))
        .await
        .expect_err("must not succeed");
    assert!(
        matches!(err, Error::AuthTimeoutExceeded { attempts: 1 }),
        "got {err:?}"
    );
    assert!(
        !server.commands().iter().any(|cmd| cmd == "baf"),
        "command must never reach the wire"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_until_credentials_recover() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);
    session.set_retries(5);
    server.fail_next_tokens(4);

    session.send_command(Command::control("baf")).await?;

    let commands = server.commands();
    assert_eq!(
        commands.iter().filter(|cmd| *cmd == "baf").count(),
        1,
        "exactly one attempt reaches the wire"
    );
    assert_eq!(server.connection_count(), 5, "four failed cycles before it");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnects_with_fresh_auth_after_server_restart() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);

    session.send_command(Command::control("beforeRestart")).await?;
    server.kick();
    poll_until("client noticing the close", || {
        session.state() == SessionState::Disconnected
    })
    .await?;

    session.send_command(Command::control("afterRestart")).await?;
    server.wait_for_command("afterRestart").await?;

    assert_eq!(server.connection_count(), 2);
    let key_exchanges = server
        .commands()
        .iter()
        .filter(|cmd| cmd.contains("keyexchange"))
        .count();
    assert_eq!(key_exchanges, 2, "the second connection authenticated afresh");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn secure_command_is_wrapped_with_the_visu_hash() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);
    let inner = Command::io_control("0f86a2fe", "on");

    session.send_secure_command(inner.clone()).await?;
    let wire = server.wait_for_command("jdev/sps/ios/").await?;

    let rest = wire.strip_prefix("jdev/sps/ios/").expect("secured prefix");
    let (hash, wrapped) = rest.split_once('/').expect("hash separator");
    assert_eq!(wrapped, inner.command());
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, server.expected_visu_hash(wrapped));
    server.wait_for_command("getvisusalt").await?;
    server.wait_for_command("authwithvisuhash").await?;

    // the credential is held for the session: no second handshake
    session
        .send_secure_command(Command::io_control("0f86a2fe", "off"))
        .await?;
    let salt_requests = server
        .commands()
        .iter()
        .filter(|cmd| cmd.contains("getvisusalt"))
        .count();
    assert_eq!(salt_requests, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn value_events_are_delivered_to_listeners() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);
    let events = Arc::new(EventCollector::default());
    session.register_event_listener(events.clone());

    session.send_command(Command::control("testCmd")).await?;

    let uuid = Uuid::new_v4();
    server.push_value_event(uuid, 42.5);
    poll_until("event delivery", || {
        events
            .seen
            .lock()
            .iter()
            .any(|event| event.uuid == uuid && event.value == 42.5)
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_alive_does_not_disturb_correlation() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);
    let collector = Arc::new(ResponseCollector::default());
    session.register_command_listener(collector.clone());

    session.send_command(Command::control("first")).await?;
    session.send_keep_alive().await?;
    server.wait_for_command("keepalive").await?;
    session.send_command(Command::control("second")).await?;

    poll_until("second response", || collector.contains("second")).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn orphan_responses_are_dropped_without_breaking_the_session() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);
    let collector = Arc::new(ResponseCollector::default());
    session.register_command_listener(collector.clone());

    session.send_command(Command::control("first")).await?;
    poll_until("first response", || collector.contains("first")).await?;

    server.push_orphan_response();
    // let the orphan arrive while nothing is in flight
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.send_command(Command::control("second")).await?;
    poll_until("second response", || collector.contains("second")).await?;
    assert!(!collector.contains("dev/sps/io/nobody/asked"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_restart_reconnects_after_remote_close() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);
    session.set_auto_restart(true);
    session.set_retries(0);

    session.send_command(Command::control("beforeRestart")).await?;
    server.kick();

    // (retries + 1) * auth_timeout + 1s with the test tuning is ~1.5s
    poll_until("auto-restart reconnect", || server.connection_count() >= 2).await?;
    let key_exchanges = server
        .commands()
        .iter()
        .filter(|cmd| cmd.contains("keyexchange"))
        .count();
    assert!(key_exchanges >= 1);
    poll_until("fresh authentication", || {
        server
            .commands()
            .iter()
            .filter(|cmd| cmd.contains("keyexchange"))
            .count()
            >= 2
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn non_websocket_commands_are_rejected_at_submission() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);

    let err = session
        .send_command(Command::api_info())
        .await
        .expect_err("http-only command must be rejected");
    assert!(matches!(err, Error::WsNotSupported(_)));
    assert_eq!(server.connection_count(), 0, "rejection precedes connecting");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn close_tears_the_session_down() -> eyre::Result<()> {
    let server = MockMiniserver::spawn().await?;
    let session = setup::session_for(&server);

    session.send_command(Command::control("testCmd")).await?;
    session.close().await?;
    assert_eq!(session.state(), SessionState::Disconnected);
    Ok(())
}
