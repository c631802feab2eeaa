use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use courier_crypto::{AuthKey, Side};
use courier_mtproto::encrypted::{self, Header};
use courier_mtproto::message::{parse_plaintext, to_plaintext_bytes, PlaintextError};
use courier_mtproto::transport::{Abridged, Full, Intermediate, PaddedIntermediate};
use courier_mtproto::{Clock, EncryptedSession, Framing, MessageId, MessageSequencer};

/// A clock the test can move by hand, backwards included.
#[derive(Clone)]
struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    fn at(nanos: u64) -> Self { Self(Arc::new(AtomicU64::new(nanos))) }
    fn set(&self, nanos: u64) { self.0.store(nanos, Ordering::SeqCst) }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration { Duration::from_nanos(self.0.load(Ordering::SeqCst)) }
}

const T0: u64 = 1_700_000_000_000_000_000;

// ── MessageSequencer ──────────────────────────────────────────────────────────

#[test]
fn ids_stay_monotonic_when_clock_steps_back() {
    let clock = ManualClock::at(T0);
    let seq = MessageSequencer::with_clock(clock.clone());

    let a = seq.next();
    clock.set(T0 - 5_000_000_000);
    let b = seq.next();
    let c = seq.next();

    assert_eq!(b.0, a.0 + 4);
    assert_eq!(c.0, b.0 + 4);
}

#[test]
fn frozen_clock_still_yields_distinct_ids() {
    let seq = MessageSequencer::with_clock(ManualClock::at(T0));
    let ids: Vec<MessageId> = (0..100).map(|_| seq.next()).collect();
    assert!(ids.windows(2).all(|w| w[1] > w[0]));
    assert!(ids.iter().all(|id| id.0 % 4 == 0));
}

#[test]
fn id_encodes_corrected_seconds() {
    let seq = MessageSequencer::with_clock(ManualClock::at(T0));
    seq.set_time_offset(30);
    assert_eq!(seq.next().0 >> 32, 1_700_000_030);
}

#[test]
fn offset_from_server_message_id() {
    let seq = MessageSequencer::with_clock(ManualClock::at(T0));
    seq.correct_from_server_id((1_700_000_100i64 << 32) | 1);
    assert_eq!(seq.time_offset(), 100);
}

#[test]
fn concurrent_callers_never_share_an_id() {
    let seq = Arc::new(MessageSequencer::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let seq = Arc::clone(&seq);
            thread::spawn(move || (0..1000).map(|_| seq.next()).collect::<Vec<_>>())
        })
        .collect();

    let mut all = Vec::new();
    for h in handles {
        let ids = h.join().unwrap();
        assert!(ids.windows(2).all(|w| w[1] > w[0]), "per-thread order must increase");
        all.extend(ids);
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), total);
}

// ── Plaintext envelope ────────────────────────────────────────────────────────

#[test]
fn plaintext_layout() {
    let wire = to_plaintext_bytes(MessageId(0x1122), &[0xaa, 0xbb]);
    assert_eq!(wire.len(), 8 + 8 + 4 + 2);
    assert_eq!(&wire[..8], &[0u8; 8]);
    assert_eq!(&wire[8..16], &0x1122i64.to_le_bytes());
    assert_eq!(&wire[16..20], &2u32.to_le_bytes());

    let (id, body) = parse_plaintext(&wire).unwrap();
    assert_eq!(id, 0x1122);
    assert_eq!(body, &[0xaa, 0xbb]);
}

#[test]
fn plaintext_rejects_keyed_frame() {
    let mut wire = to_plaintext_bytes(MessageId(8), &[]);
    wire[0] = 1;
    assert_eq!(parse_plaintext(&wire), Err(PlaintextError::NotPlaintext { auth_key_id: 1 }));
    assert_eq!(parse_plaintext(&wire[..10]), Err(PlaintextError::TooShort { len: 10 }));
}

// ── Framing + encryption ──────────────────────────────────────────────────────

fn through(framing: &mut dyn Framing, peer: &mut dyn Framing, payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::new();
    framing.pack(payload, &mut wire);
    let got = peer.unpack(&wire).unwrap();
    assert_eq!(got.consumed, wire.len());
    got.payload
}

#[test]
fn sealed_message_crosses_every_framing() {
    let key = AuthKey::from_bytes([7; 256]);
    let mut session = EncryptedSession::with_session_id(key.clone(), 5, Arc::new(MessageSequencer::new()), 99);
    let packed = session.pack(&[9, 9, 9, 9, 1, 2, 3, 4], true).unwrap();

    let pairs: Vec<(Box<dyn Framing>, Box<dyn Framing>)> = vec![
        (Box::new(Abridged), Box::new(Abridged)),
        (Box::new(Intermediate), Box::new(Intermediate)),
        (Box::new(PaddedIntermediate), Box::new(PaddedIntermediate)),
        (Box::new(Full::default()), Box::new(Full::default())),
    ];
    for (mut tx, mut rx) in pairs {
        let mut frame = through(tx.as_mut(), rx.as_mut(), &packed.bytes);
        let msg = encrypted::open(&key, Side::Client, &mut frame).unwrap();
        assert_eq!(msg.header.session_id, 99);
        assert_eq!(msg.body, [9, 9, 9, 9, 1, 2, 3, 4]);
    }
}

#[test]
fn server_reply_reaches_client_session() {
    let key = AuthKey::from_bytes([3; 256]);
    let session = EncryptedSession::with_session_id(key.clone(), 1, Arc::new(MessageSequencer::new()), 42);
    let header = Header { salt: 1, session_id: 42, msg_id: (1_700_000_000i64 << 32) | 1, seq_no: 1 };
    let mut frame = encrypted::seal(&key, Side::Server, header, &0x997275b5u32.to_le_bytes()).unwrap();

    let msg = session.unpack(&mut frame).unwrap();
    assert_eq!(msg.header, header);
    assert_eq!(msg.body, 0x997275b5u32.to_le_bytes());
}
