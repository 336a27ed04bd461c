//! The correlated call subject.
//!
//! A [`CallSubject`] represents one outstanding call on a shared, multiplexed
//! connection. The external registry that owns the call-id → subject mapping
//! routes inbound replies to [`CallSubject::deliver`] and connection loss to
//! [`CallSubject::disconnect`]; the call-issuing side sends through the
//! subject and awaits one of the accessor methods.
//!
//! # State machine
//!
//! The subject holds exactly one listener slot, modeled as a tagged variant:
//!
//! - `Buffering(slot)`: nobody is waiting; at most one reply parks here and
//!   is replayed to the next listener.
//! - `Active(callback)`: a listener is installed; each delivered reply
//!   drives it synchronously.
//! - `Closed`: the connection died; further replies are discarded.
//!
//! Installing a listener always supersedes the previous one: this is a
//! single-outstanding-wait abstraction, not a broadcast.
//!
//! # Concurrency
//!
//! `send`, `deliver`, `on_reply`, `on_rejected`, and `disconnect` are
//! synchronous and never suspend; only the accessors await. The state is
//! mutex-guarded so the dispatch loop may run on a different thread than the
//! awaiting task. The state lock is never held while a user callback runs,
//! so listeners, rejection callbacks, and the send continuation may call
//! back into the subject.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::{
    // ---
    log_debug,
    log_error,
    log_warn,
    Error,
    Kind,
    Reply,
    Result,
    ACK,
};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Mutex poisoning indicates that another task panicked while holding the
/// lock. The protected state here is a single call's listener slot and its
/// release callback; there are no invariants spanning multiple subjects, and
/// the worst outcome is one dropped reply on an already-panicking call.
///
/// This avoids propagating non-`Send` poison errors across async boundaries.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Verdict returned by a reply listener after handling one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listen {
    /// Keep this listener installed for the next reply.
    Keep,
    /// This listener is finished; revert to the buffering default.
    ///
    /// The reversion happens synchronously inside [`CallSubject::deliver`],
    /// so a late reply arriving after the listener settled is buffered
    /// rather than dropped.
    Done,
}

type SendFn = Box<dyn FnMut(Kind, Option<Bytes>) + Send>;
type ReleaseFn = Box<dyn FnOnce() + Send>;
type ListenerFn = Box<dyn FnMut(Reply) -> Listen + Send>;
type RejectFn = Box<dyn FnOnce(Error) + Send>;

/// Listener slot of a subject. See the module docs for the transitions.
enum Listener {
    // ---
    /// No listener installed; at most one reply parks in the slot.
    Buffering(Option<Reply>),

    /// An installed listener, driven once per delivered reply.
    Active(ListenerFn),

    /// Permanent no-op after disconnect.
    Closed,
}

struct State {
    // ---
    /// Taken on the first terminal transition; `None` afterwards, which is
    /// what makes release at-most-once by construction.
    release: Option<ReleaseFn>,

    listener: Listener,

    rejection: Option<RejectFn>,
}

struct Inner {
    /// Kept outside `state` so a continuation that synchronously loops a
    /// reply back into `deliver` does not deadlock on the state lock.
    send: Mutex<SendFn>,

    state: Mutex<State>,
}

impl Drop for Inner {
    /// Leaked-subject detection.
    ///
    /// A subject dropped with its release callback still armed never reached
    /// a terminal state: some caller stopped awaiting without disconnecting.
    /// The registry entry is gone along with us, so there is nothing left to
    /// release, but the contract violation must stay visible.
    fn drop(&mut self) {
        // ---
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if state.release.is_some() {
            log_error!(
                "call subject dropped before reaching a terminal state; release() never ran"
            );
        }
    }
}

/// Handle for one outstanding correlated call.
///
/// Cheap to clone (internally `Arc`-backed); the registry holds one clone,
/// the awaiting task another.
///
/// # Release rules
///
/// The release callback runs exactly once, on the first terminal transition:
///
/// - [`ack_then_close`](Self::ack_then_close) releases on every settled
///   outcome (acknowledgement, error reply, or type mismatch).
/// - [`wait_next`](Self::wait_next) and [`first_then_close`](Self::first_then_close)
///   release on an error-tagged reply, but **not** on a plain type mismatch:
///   the call may still be salvageable (e.g. an unexpected interim frame in a
///   streamed exchange), so the registry keeps routing to this subject.
/// - [`first_then_close`](Self::first_then_close) additionally releases on a
///   matched reply, even if the subsequent body parse fails: the message was
///   correctly correlated, only decoding failed.
/// - [`wait_next_message`](Self::wait_next_message) never releases; the
///   caller may still need to send follow-ups.
/// - [`disconnect`](Self::disconnect) always releases.
#[derive(Clone)]
pub struct CallSubject {
    inner: Arc<Inner>,
}

impl CallSubject {
    // ---
    /// Create a subject for one outstanding call.
    ///
    /// `send` performs the actual framing/write onto the shared connection.
    /// `release` removes this subject from the call-id registry that routes
    /// [`deliver`](Self::deliver)/[`disconnect`](Self::disconnect) to it; it
    /// runs exactly once, on the first terminal transition.
    pub fn new(
        send: impl FnMut(Kind, Option<Bytes>) + Send + 'static,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                send: Mutex::new(Box::new(send)),
                state: Mutex::new(State {
                    release: Some(Box::new(release)),
                    listener: Listener::Buffering(None),
                    rejection: None,
                }),
            }),
        }
    }

    /// Send a message in this call's context.
    ///
    /// Delegates to the send continuation; transmission failures surface
    /// however the continuation surfaces them (synchronously, or by a later
    /// [`disconnect`](Self::disconnect)). Returns the subject for chaining
    /// with an immediately following accessor.
    pub fn send(&self, kind: Kind, body: Option<Bytes>) -> &Self {
        // ---
        let mut send = lock_ignore_poison(&self.inner.send);
        (*send)(kind, body);
        drop(send);
        self
    }

    /// Send a message with a JSON-encoded typed body.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding `body` fails; nothing is
    /// sent in that case.
    pub fn send_body<T: Serialize>(&self, kind: Kind, body: &T) -> Result<&Self> {
        // ---
        let bytes = Bytes::from(serde_json::to_vec(body)?);
        Ok(self.send(kind, Some(bytes)))
    }

    /// Dispatcher entry point for an inbound reply correlated to this call.
    ///
    /// With a listener installed, drives it synchronously to completion and
    /// applies its [`Listen`] verdict. With no listener, parks the reply in
    /// the single buffer slot for the next [`on_reply`](Self::on_reply); the
    /// transport contract is at most one reply before a listener attaches,
    /// so an occupied slot is overwritten newest-wins rather than treated as
    /// a hard fault. After [`disconnect`](Self::disconnect), replies are
    /// silently discarded.
    pub fn deliver(&self, reply: Reply) {
        // ---
        let mut listener = {
            let mut state = lock_ignore_poison(&self.inner.state);

            match &mut state.listener {
                Listener::Closed => {
                    log_debug!("reply discarded after disconnect (kind={})", reply.kind());
                    return;
                }
                Listener::Buffering(slot) => {
                    if slot.is_some() {
                        log_debug!("unread buffered reply overwritten (kind={})", reply.kind());
                    }
                    *slot = Some(reply);
                    return;
                }
                Listener::Active(_) => {}
            }

            // Swap the listener out so it runs without the lock held; the
            // slot reads as Buffering(None) for the duration of the call.
            match mem::replace(&mut state.listener, Listener::Buffering(None)) {
                Listener::Active(listener) => listener,
                _ => unreachable!("checked Active above"),
            }
        };

        let verdict = listener(reply);

        let mut state = lock_ignore_poison(&self.inner.state);
        if verdict == Listen::Keep && matches!(state.listener, Listener::Buffering(None)) {
            // Reinstall unless the callback itself installed a replacement
            // or a disconnect closed the subject meanwhile.
            state.listener = Listener::Active(listener);
        }
    }

    /// Install a reply listener, superseding any previous one.
    ///
    /// If a reply is already buffered it is delivered to the new listener
    /// immediately and synchronously, with the buffer cleared. A waiter
    /// whose listener is superseded fails with [`Error::Superseded`].
    ///
    /// This is the low-level hook the standard accessors are built from;
    /// use it directly only for custom wait semantics. No-op once the
    /// subject is disconnected.
    pub fn on_reply(&self, listener: impl FnMut(Reply) -> Listen + Send + 'static) -> &Self {
        // ---
        let previous = {
            let mut state = lock_ignore_poison(&self.inner.state);
            if matches!(state.listener, Listener::Closed) {
                None
            } else {
                Some(mem::replace(
                    &mut state.listener,
                    Listener::Active(Box::new(listener)),
                ))
            }
        };

        if let Some(Listener::Buffering(Some(reply))) = previous {
            self.deliver(reply);
        }

        self
    }

    /// Replace the rejection callback.
    ///
    /// Separate from the reply listener because rejection originates from
    /// the transport layer, asynchronously and independently of any reply.
    /// The callback is consumed by [`disconnect`](Self::disconnect). A
    /// rejection that fires while no callback is registered is dropped;
    /// unlike replies there is no buffering slot for errors, so attach the
    /// callback before the rejection can occur.
    pub fn on_rejected(&self, callback: impl FnOnce(Error) + Send + 'static) -> &Self {
        // ---
        let mut state = lock_ignore_poison(&self.inner.state);
        if matches!(state.listener, Listener::Closed) {
            // Already disconnected; the cause was consumed (or dropped) then.
            drop(state);
            return self;
        }
        state.rejection = Some(Box::new(callback));
        drop(state);
        self
    }

    /// Dispatcher entry point for loss of the shared connection.
    ///
    /// Invokes and clears the rejection callback with `error` (defaulting to
    /// [`Error::ConnectionClosed`]), turns the listener into a permanent
    /// no-op, and releases the subject. Must be called once per still-open
    /// subject when the connection dies; extra calls are no-ops.
    pub fn disconnect(&self, error: Option<Error>) {
        // ---
        let (rejection, release) = {
            let mut state = lock_ignore_poison(&self.inner.state);
            state.listener = Listener::Closed;
            (state.rejection.take(), state.release.take())
        };

        if let Some(reject) = rejection {
            reject(error.unwrap_or(Error::ConnectionClosed));
        } else if error.is_some() {
            log_warn!("disconnect cause dropped: no rejection callback registered");
        }

        if let Some(release) = release {
            release();
        }
    }

    /// Run the release callback if it has not run yet.
    fn release(&self) {
        // ---
        let release = lock_ignore_poison(&self.inner.state).release.take();
        if let Some(release) = release {
            release();
        }
    }

    /// Arm a one-shot waiter: a listener that settles with the next reply
    /// and a rejection callback that settles with the failure cause.
    ///
    /// The shared settle slot enforces resolve-exactly-once; whichever side
    /// fires first takes the sender. The listener reverts the subject to
    /// buffering ([`Listen::Done`]) the moment it settles.
    fn arm(&self) -> oneshot::Receiver<Result<Reply>> {
        // ---
        let (tx, rx) = oneshot::channel();

        if matches!(
            lock_ignore_poison(&self.inner.state).listener,
            Listener::Closed
        ) {
            // The cause went to whoever was listening at disconnect time.
            let _ = tx.send(Err(Error::ConnectionClosed));
            return rx;
        }

        let settle = Arc::new(Mutex::new(Some(tx)));
        let reply_settle = Arc::clone(&settle);
        let closed_settle = Arc::clone(&settle);

        self.on_reply(move |reply| {
            // ---
            match lock_ignore_poison(&reply_settle).take() {
                Some(tx) => {
                    let _ = tx.send(Ok(reply));
                }
                None => debug_assert!(false, "reply listener driven after settling"),
            }
            Listen::Done
        });

        self.on_rejected(move |error| {
            // ---
            if let Some(tx) = lock_ignore_poison(&settle).take() {
                let _ = tx.send(Err(error));
            }
        });

        // A disconnect can land between the pre-check and the installs
        // above; both installs no-op on a closed subject and the cause has
        // already been consumed, so settle with the generic closure error
        // rather than letting the waiter see a dropped channel.
        if matches!(
            lock_ignore_poison(&self.inner.state).listener,
            Listener::Closed
        ) {
            if let Some(tx) = lock_ignore_poison(&closed_settle).take() {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }

        rx
    }

    /// Await the next reply or rejection for this call.
    async fn next_settled(&self) -> Result<Reply> {
        // ---
        match self.arm().await {
            Ok(settled) => settled,
            // Sender dropped: a later on_reply() superseded our listener.
            Err(_) => Err(Error::Superseded),
        }
    }

    /// Shared tail of the type-matched accessors.
    ///
    /// `terminal` controls whether a matched reply releases the subject;
    /// an error-tagged reply always does, a plain type mismatch never does.
    async fn next_of_kind(&self, expected: Kind, terminal: bool) -> Result<Reply> {
        // ---
        match self.next_settled().await {
            Ok(reply) if reply.is_error() => {
                self.release();
                Err(reply.to_error())
            }
            Ok(reply) if reply.kind() == expected => {
                if terminal {
                    self.release();
                }
                Ok(reply)
            }
            Ok(reply) => Err(Error::UnexpectedMessageType {
                expected,
                actual: reply.kind(),
            }),
            Err(error) => Err(error),
        }
    }

    /// Await the acknowledgement and close the call.
    ///
    /// Every settled outcome is terminal: the subject is released whether
    /// the reply was the acknowledgement, an error-tagged reply, or a
    /// mismatched type.
    ///
    /// # Errors
    ///
    /// - `Error::Remote` if the reply carried a server/application error
    /// - `Error::UnexpectedMessageType` if a non-acknowledgement reply arrived
    /// - the rejection cause if the connection was lost
    pub async fn ack_then_close(&self) -> Result<()> {
        // ---
        match self.next_settled().await {
            Ok(reply) if reply.is_error() => {
                self.release();
                Err(reply.to_error())
            }
            Ok(reply) if reply.kind() == ACK => {
                self.release();
                Ok(())
            }
            Ok(reply) => {
                self.release();
                Err(Error::UnexpectedMessageType {
                    expected: ACK,
                    actual: reply.kind(),
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Await the next reply, whatever its type, without releasing.
    ///
    /// The caller inspects the raw message and may still send follow-ups in
    /// this call's context; releasing remains the caller's responsibility
    /// via a closing accessor or `disconnect`.
    ///
    /// # Errors
    ///
    /// Returns the rejection cause if the connection was lost, or
    /// `Error::Superseded` if another listener replaced this waiter.
    pub async fn wait_next_message(&self) -> Result<Reply> {
        self.next_settled().await
    }

    /// Await the next reply of the given type, discarding its body.
    ///
    /// Not terminal on success or on a type mismatch; see the release rules
    /// in the type-level docs.
    ///
    /// # Errors
    ///
    /// - `Error::Remote` on an error-tagged reply (releases the subject)
    /// - `Error::UnexpectedMessageType` on a wrong type tag (does **not** release)
    /// - the rejection cause if the connection was lost
    pub async fn wait_next(&self, kind: Kind) -> Result<()> {
        // ---
        self.next_of_kind(kind, false).await.map(|_| ())
    }

    /// Await the next reply of the given type and parse its body.
    ///
    /// Same release rules as [`wait_next`](Self::wait_next); a parse failure
    /// does not release either, since the call itself is still live.
    ///
    /// # Errors
    ///
    /// As [`wait_next`](Self::wait_next), plus `Error::Serialization` if the
    /// body does not parse as `T`.
    pub async fn wait_next_body<T: DeserializeOwned>(&self, kind: Kind) -> Result<T> {
        // ---
        let reply = self.next_of_kind(kind, false).await?;
        reply.parse()
    }

    /// Await the first reply of the given type and close the call.
    ///
    /// Terminal on a matched reply and on an error-tagged reply; a plain
    /// type mismatch leaves the subject un-released, since the registry may
    /// still expect further traffic on this call id.
    ///
    /// # Errors
    ///
    /// - `Error::Remote` on an error-tagged reply (releases the subject)
    /// - `Error::UnexpectedMessageType` on a wrong type tag (does **not** release)
    /// - the rejection cause if the connection was lost
    pub async fn first_then_close(&self, kind: Kind) -> Result<Reply> {
        // ---
        self.next_of_kind(kind, true).await
    }

    /// Await the first reply of the given type, parse its body, and close.
    ///
    /// The subject is released as soon as the matched reply arrives, even if
    /// the body then fails to parse: the message was correctly correlated,
    /// only decoding failed.
    ///
    /// # Errors
    ///
    /// As [`first_then_close`](Self::first_then_close), plus
    /// `Error::Serialization` if the body does not parse as `T`.
    pub async fn first_then_close_body<T: DeserializeOwned>(&self, kind: Kind) -> Result<T> {
        // ---
        let reply = self.next_of_kind(kind, true).await?;
        reply.parse()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Subject with a recording send continuation and a release counter.
    fn test_subject() -> (CallSubject, Arc<Mutex<Vec<Kind>>>, Arc<AtomicUsize>) {
        // ---
        let sent = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(AtomicUsize::new(0));

        let sent_log = Arc::clone(&sent);
        let release_count = Arc::clone(&released);

        let subject = CallSubject::new(
            move |kind, _body| sent_log.lock().unwrap().push(kind),
            move || {
                release_count.fetch_add(1, Ordering::SeqCst);
            },
        );

        (subject, sent, released)
    }

    /// Listener that records every reply it sees.
    fn recording_listener(log: &Arc<Mutex<Vec<Reply>>>, verdict: Listen) -> impl FnMut(Reply) -> Listen {
        // ---
        let log = Arc::clone(log);
        move |reply| {
            log.lock().unwrap().push(reply);
            verdict
        }
    }

    #[test]
    fn test_send_invokes_continuation_and_chains() {
        // ---
        let (subject, sent, released) = test_subject();

        subject.send(4, None).send(5, Some(Bytes::from("x")));

        assert_eq!(*sent.lock().unwrap(), vec![4, 5]);
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_send_body_encodes_json() {
        // ---
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&bodies);

        let subject = CallSubject::new(move |_, body| log.lock().unwrap().push(body), || {});
        subject.send_body(9, &serde_json::json!({"a": 1})).unwrap();

        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].as_deref(), Some(br#"{"a":1}"#.as_slice()));
    }

    #[test]
    fn test_buffer_then_replay() {
        // ---
        let (subject, _, _) = test_subject();
        let seen = Arc::new(Mutex::new(Vec::new()));

        // Reply arrives before anyone is listening.
        subject.deliver(Reply::new(7, Bytes::from("early")));

        // Installing the listener replays the buffered reply synchronously.
        subject.on_reply(recording_listener(&seen, Listen::Keep));
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].kind(), 7);
        }

        // Buffer is empty afterwards: the next deliver is a fresh reply,
        // not a second replay.
        subject.deliver(Reply::new(8, Bytes::new()));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_buffer_overwrite_keeps_newest() {
        // ---
        let (subject, _, _) = test_subject();
        let seen = Arc::new(Mutex::new(Vec::new()));

        subject.deliver(Reply::new(1, Bytes::new()));
        subject.deliver(Reply::new(2, Bytes::new()));

        subject.on_reply(recording_listener(&seen, Listen::Keep));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind(), 2);
    }

    #[test]
    fn test_listener_replacement_is_total() {
        // ---
        let (subject, _, _) = test_subject();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        subject.on_reply(recording_listener(&first, Listen::Keep));
        subject.on_reply(recording_listener(&second, Listen::Keep));

        subject.deliver(Reply::new(3, Bytes::new()));

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_done_verdict_reverts_to_buffering() {
        // ---
        let (subject, _, _) = test_subject();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        subject.on_reply(recording_listener(&first, Listen::Done));

        subject.deliver(Reply::new(1, Bytes::new()));
        // Listener settled; this one must be buffered, not dropped.
        subject.deliver(Reply::new(2, Bytes::new()));

        assert_eq!(first.lock().unwrap().len(), 1);

        subject.on_reply(recording_listener(&second, Listen::Keep));
        let second = second.lock().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind(), 2);
    }

    #[test]
    fn test_disconnect_rejects_and_releases_once() {
        // ---
        let (subject, _, released) = test_subject();
        let causes = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&causes);
        subject.on_rejected(move |error| log.lock().unwrap().push(error));

        subject.disconnect(None);
        subject.disconnect(None); // idempotent

        assert_eq!(released.load(Ordering::SeqCst), 1);

        let causes = causes.lock().unwrap();
        assert_eq!(causes.len(), 1);
        assert!(matches!(causes[0], Error::ConnectionClosed));
    }

    #[test]
    fn test_disconnect_passes_transport_cause() {
        // ---
        let (subject, _, _) = test_subject();
        let causes = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&causes);
        subject.on_rejected(move |error| log.lock().unwrap().push(error));

        subject.disconnect(Some(Error::Remote(Arc::from("broker shutdown"))));

        let causes = causes.lock().unwrap();
        match &causes[0] {
            Error::Remote(reason) => assert_eq!(&**reason, "broker shutdown"),
            other => panic!("expected remote cause, got {other:?}"),
        }
    }

    #[test]
    fn test_deliver_after_disconnect_is_discarded() {
        // ---
        let (subject, _, released) = test_subject();
        let seen = Arc::new(Mutex::new(Vec::new()));

        subject.disconnect(None);

        // Listener installation is a no-op once closed, and replies no
        // longer buffer.
        subject.deliver(Reply::ack());
        subject.on_reply(recording_listener(&seen, Listen::Keep));
        subject.deliver(Reply::ack());

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_runs_once_across_disconnects() {
        // ---
        let (subject, _, released) = test_subject();

        subject.disconnect(None);
        subject.disconnect(Some(Error::ConnectionClosed));
        subject.disconnect(None);

        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
