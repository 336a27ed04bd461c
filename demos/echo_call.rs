//! Minimal wiring of a `CallSubject` to a toy call-id registry.
//!
//! The registry and dispatch loop live outside the library; this demo plays
//! both roles in a few lines to show the contract: insert the subject under
//! its call id, route the reply to `deliver`, and let the release callback
//! reclaim the registry slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rpc_subject::{CallSubject, Kind, Reply};

const OPEN: Kind = 10;

#[tokio::main]
async fn main() -> rpc_subject::Result<()> {
    // ---
    let registry: Arc<Mutex<HashMap<u64, CallSubject>>> = Arc::new(Mutex::new(HashMap::new()));
    let call_id = 1u64;

    let slots = Arc::clone(&registry);
    let subject = CallSubject::new(
        move |kind, body: Option<Bytes>| {
            println!(
                "frame out: kind={kind} body={} bytes",
                body.map_or(0, |b| b.len())
            );
        },
        move || {
            slots.lock().unwrap().remove(&call_id);
            println!("call {call_id} released");
        },
    );
    registry.lock().unwrap().insert(call_id, subject.clone());

    // Pretend the dispatch loop routed an acknowledgement back to this call.
    let dispatcher = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let subject = registry.lock().unwrap().get(&call_id).cloned();
            if let Some(subject) = subject {
                subject.deliver(Reply::ack());
            }
        })
    };

    subject.send(OPEN, None).ack_then_close().await?;
    dispatcher.await.expect("dispatcher task panicked");

    assert!(registry.lock().unwrap().is_empty());
    println!("registry empty, call cycle complete");
    Ok(())
}
