use std::{collections::HashMap, io, time::Duration};

use thiserror::Error;
use tokio::{io::AsyncWrite, sync::Mutex, time::timeout};

use crate::protocol::{self, ChatLine, ProtocolError};

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Nickname to session mapping shared by every connection handler.
///
/// A single lock guards the map. `route` holds it for the whole call, so no
/// session can join or leave while a line is being delivered; each write is
/// bounded by the delivery timeout to keep a stalled peer from pinning it.
/// A sink whose write failed or timed out is dropped and never written again,
/// while the nickname stays taken until the owning handler deregisters it.
pub struct Registry<W> {
    sessions: Mutex<HashMap<String, Session<W>>>,
    delivery_timeout: Duration,
}

struct Session<W> {
    /// `None` once a delivery to this session has failed.
    sink: Option<W>,
}

/// Returned when a nickname is already in use. Hands the sink back so the
/// handshake can carry on over the same connection.
#[derive(Debug)]
pub struct NicknameTaken<W> {
    pub sink: W,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),
    #[error("connection dropped after an earlier failed delivery")]
    Closed,
}

#[derive(Debug)]
pub struct DeliveryFailure {
    pub recipient: String,
    pub error: DeliveryError,
}

/// Failed deliveries from a single `route` call. Successful writes are not
/// recorded.
#[derive(Debug, Default)]
pub struct RouteReport {
    pub failures: Vec<DeliveryFailure>,
}

impl RouteReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<W> Default for Registry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_TIMEOUT)
    }
}

impl<W> Registry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            delivery_timeout,
        }
    }

    pub async fn register(&self, nickname: &str, sink: W) -> Result<(), NicknameTaken<W>> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(nickname) {
            return Err(NicknameTaken { sink });
        }
        sessions.insert(nickname.to_string(), Session { sink: Some(sink) });
        Ok(())
    }

    /// Removes the session, returning whether one was registered. Unknown
    /// nicknames are a no-op.
    pub async fn deregister(&self, nickname: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(nickname).is_some()
    }

    pub async fn contains(&self, nickname: &str) -> bool {
        self.sessions.lock().await.contains_key(nickname)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Sorted snapshot of the registered nicknames.
    pub async fn nicknames(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut nicknames: Vec<String> = sessions.keys().cloned().collect();
        nicknames.sort();
        nicknames
    }

    /// Resolves one chat line from `sender` into deliveries.
    pub async fn route(&self, sender: &str, line: &str) -> RouteReport {
        let mut sessions = self.sessions.lock().await;
        let mut report = RouteReport::default();

        match ChatLine::parse(line) {
            ChatLine::Malformed => {
                let notice = ProtocolError::InvalidFormat.to_string();
                self.deliver(&mut sessions, sender, &notice, &mut report).await;
            }
            ChatLine::Private { target, body } => {
                if sessions.contains_key(target) {
                    let text = protocol::private_line(sender, target, body);
                    self.deliver(&mut sessions, target, &text, &mut report).await;
                    self.deliver(&mut sessions, sender, &text, &mut report).await;
                } else {
                    let notice = ProtocolError::UnknownUser(target.to_string()).to_string();
                    self.deliver(&mut sessions, sender, &notice, &mut report).await;
                }
            }
            ChatLine::Public(text) => {
                let public = protocol::public_line(sender, text);
                let echo = protocol::echo_line(sender, text);
                for (nickname, session) in sessions.iter_mut() {
                    let outgoing = if nickname == sender { &echo } else { &public };
                    if let Err(error) = self.write_to(session, outgoing).await {
                        report.failures.push(DeliveryFailure {
                            recipient: nickname.clone(),
                            error,
                        });
                    }
                }
            }
        }

        report
    }

    async fn deliver(
        &self,
        sessions: &mut HashMap<String, Session<W>>,
        recipient: &str,
        line: &str,
        report: &mut RouteReport,
    ) {
        // Absent recipients have nothing to receive.
        let Some(session) = sessions.get_mut(recipient) else {
            return;
        };
        if let Err(error) = self.write_to(session, line).await {
            report.failures.push(DeliveryFailure {
                recipient: recipient.to_string(),
                error,
            });
        }
    }

    async fn write_to(&self, session: &mut Session<W>, line: &str) -> Result<(), DeliveryError> {
        let Some(sink) = session.sink.as_mut() else {
            return Err(DeliveryError::Closed);
        };
        let result = match timeout(self.delivery_timeout, protocol::write_line(sink, line)).await {
            Ok(result) => result.map_err(DeliveryError::from),
            Err(_) => Err(DeliveryError::TimedOut(self.delivery_timeout)),
        };
        if result.is_err() {
            // Part of the line may already be on the wire; appending to it
            // would break framing, so close the connection instead.
            session.sink = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{BufReader, DuplexStream, duplex};

    use super::*;
    use crate::protocol::read_line;

    type Inbox = BufReader<DuplexStream>;

    async fn join(registry: &Registry<DuplexStream>, nickname: &str) -> Inbox {
        let (sink, inbox) = duplex(1024);
        registry
            .register(nickname, sink)
            .await
            .expect("registration should pass");
        BufReader::new(inbox)
    }

    async fn next_line(inbox: &mut Inbox) -> String {
        tokio::time::timeout(Duration::from_secs(1), read_line(inbox))
            .await
            .expect("line within timeout")
            .expect("read line")
            .expect("inbox open")
    }

    async fn assert_silent(inbox: &mut Inbox) {
        let pending = tokio::time::timeout(Duration::from_millis(50), read_line(inbox)).await;
        assert!(pending.is_err(), "expected no line, got {pending:?}");
    }

    #[tokio::test]
    async fn rejects_duplicate_nicknames_and_returns_sink() {
        let registry = Registry::default();
        let _alice = join(&registry, "alice").await;

        let (sink, inbox) = duplex(64);
        let NicknameTaken { mut sink } = registry
            .register("alice", sink)
            .await
            .expect_err("duplicate nickname should be rejected");
        assert_eq!(registry.len().await, 1);

        protocol::write_line(&mut sink, "still connected")
            .await
            .expect("returned sink is usable");
        assert_eq!(next_line(&mut BufReader::new(inbox)).await, "still connected");
    }

    #[tokio::test]
    async fn concurrent_registration_admits_exactly_one() {
        let registry = Arc::new(Registry::<DuplexStream>::default());
        let mut attempts = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            attempts.push(tokio::spawn(async move {
                let (sink, _inbox) = duplex(64);
                registry.register("alice", sink).await.is_ok()
            }));
        }

        let mut accepted = 0;
        for attempt in attempts {
            if attempt.await.expect("registration task") {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(registry.nicknames().await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn deregister_frees_nickname_and_is_idempotent() {
        let registry = Registry::default();
        let _alice = join(&registry, "alice").await;

        assert!(registry.deregister("alice").await);
        assert!(!registry.deregister("alice").await);
        assert!(registry.is_empty().await);

        let _again = join(&registry, "alice").await;
        assert!(registry.contains("alice").await);
    }

    #[tokio::test]
    async fn public_line_echoes_to_sender_and_broadcasts_to_others() {
        let registry = Registry::default();
        let mut s = join(&registry, "s").await;
        let mut x = join(&registry, "x").await;
        let mut y = join(&registry, "y").await;

        let report = registry.route("s", "hello all").await;
        assert!(report.is_clean());

        assert_eq!(next_line(&mut s).await, "[You] s: hello all");
        assert_eq!(next_line(&mut x).await, "[Public] s: hello all");
        assert_eq!(next_line(&mut y).await, "[Public] s: hello all");
        assert_silent(&mut s).await;
        assert_silent(&mut x).await;
        assert_silent(&mut y).await;
    }

    #[tokio::test]
    async fn private_line_reaches_target_and_sender_only() {
        let registry = Registry::default();
        let mut s = join(&registry, "s").await;
        let mut x = join(&registry, "x").await;
        let mut y = join(&registry, "y").await;

        registry.route("s", "@x hello").await;

        assert_eq!(next_line(&mut x).await, "[Private] s -> x: hello");
        assert_eq!(next_line(&mut s).await, "[Private] s -> x: hello");
        assert_silent(&mut y).await;
    }

    #[tokio::test]
    async fn unknown_target_notifies_sender() {
        let registry = Registry::default();
        let mut s = join(&registry, "s").await;
        let mut y = join(&registry, "y").await;

        registry.route("s", "@x hello").await;

        assert_eq!(next_line(&mut s).await, "User 'x' not found.");
        assert_silent(&mut y).await;
    }

    #[tokio::test]
    async fn missing_body_is_rejected_without_delivery() {
        let registry = Registry::default();
        let mut s = join(&registry, "s").await;
        let mut x = join(&registry, "x").await;

        registry.route("s", "@x").await;

        assert_eq!(
            next_line(&mut s).await,
            "Invalid message format. Use @username <message>"
        );
        assert_silent(&mut s).await;
        assert_silent(&mut x).await;
    }

    #[tokio::test]
    async fn broken_recipient_does_not_block_others() {
        let registry = Registry::default();
        let mut s = join(&registry, "s").await;
        let dead = join(&registry, "dead").await;
        let mut y = join(&registry, "y").await;
        drop(dead);

        let report = registry.route("s", "anyone there?").await;

        assert_eq!(next_line(&mut s).await, "[You] s: anyone there?");
        assert_eq!(next_line(&mut y).await, "[Public] s: anyone there?");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].recipient, "dead");
        assert!(matches!(report.failures[0].error, DeliveryError::Io(_)));
    }

    #[tokio::test]
    async fn stalled_recipient_times_out() {
        let registry = Registry::new(Duration::from_millis(50));
        let mut s = join(&registry, "s").await;
        // A tiny buffer that nobody drains fills up on the first line.
        let (sink, _stalled) = duplex(4);
        registry.register("slow", sink).await.expect("register slow");

        let report = registry.route("s", "a line longer than four bytes").await;

        assert_eq!(next_line(&mut s).await, "[You] s: a line longer than four bytes");
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].error, DeliveryError::TimedOut(_)));
    }

    #[tokio::test]
    async fn timed_out_sink_is_closed_instead_of_reused() {
        let registry = Registry::new(Duration::from_millis(50));
        let mut s = join(&registry, "s").await;
        let (sink, slow) = duplex(16);
        registry.register("slow", sink).await.expect("register slow");

        let first = registry
            .route("s", "first message is longer than sixteen bytes")
            .await;
        assert_eq!(first.failures.len(), 1);
        assert!(matches!(first.failures[0].error, DeliveryError::TimedOut(_)));
        assert_eq!(
            next_line(&mut s).await,
            "[You] s: first message is longer than sixteen bytes"
        );

        let second = registry.route("s", "second").await;
        assert_eq!(next_line(&mut s).await, "[You] s: second");
        assert_eq!(second.failures.len(), 1);
        assert_eq!(second.failures[0].recipient, "slow");
        assert!(matches!(second.failures[0].error, DeliveryError::Closed));

        // The slow peer sees the truncated first line and then EOF, never a
        // later message glued onto it.
        let mut slow = BufReader::new(slow);
        assert_eq!(next_line(&mut slow).await, "[Public] s: firs");
        let eof = tokio::time::timeout(Duration::from_secs(1), read_line(&mut slow))
            .await
            .expect("eof within timeout")
            .expect("read eof");
        assert_eq!(eof, None);
        assert!(registry.contains("slow").await);
    }

    #[tokio::test]
    async fn healthy_sessions_keep_framing_after_a_failed_delivery() {
        let registry = Registry::default();
        let mut s = join(&registry, "s").await;
        let dead = join(&registry, "dead").await;
        let mut y = join(&registry, "y").await;
        drop(dead);

        registry.route("s", "one").await;
        let report = registry.route("s", "@y two").await;
        registry.route("s", "three").await;

        assert!(report.is_clean());
        assert_eq!(next_line(&mut y).await, "[Public] s: one");
        assert_eq!(next_line(&mut y).await, "[Private] s -> y: two");
        assert_eq!(next_line(&mut y).await, "[Public] s: three");
        assert_eq!(next_line(&mut s).await, "[You] s: one");
        assert_eq!(next_line(&mut s).await, "[Private] s -> y: two");
        assert_eq!(next_line(&mut s).await, "[You] s: three");
    }
}
