//! Replay through the configurator: a sub-pipeline that asks for a
//! replay on its first run sees the full captured stream again, and
//! the replay signal never surfaces downstream.

use std::cell::RefCell;
use std::rc::Rc;

use sluice_core::event::Event;
use sluice_core::input::EventLog;
use sluice_core::filters::Replay;
use sluice_core::scheduler;
use sluice_engine::{Configuration, ExportRegistry, StreamError};

#[test]
fn test_replay_bound_via_to() {
    let attempts = Rc::new(std::cell::Cell::new(0u32));

    let mut cfg = Configuration::new("replay");
    {
        let attempts = Rc::clone(&attempts);
        cfg.pipeline("flaky").handle(Rc::new(move |_ctx, evt| {
            if matches!(evt, Event::Data(_)) {
                let n = attempts.get();
                attempts.set(n + 1);
                if n == 0 {
                    return Err(StreamError::Replay);
                }
            }
            Ok(())
        }));
    }
    cfg.pipeline("main").append(Box::new(Replay::new())).to("flaky");
    let bindings = cfg.bind(&mut ExportRegistry::new()).unwrap();

    let layout = bindings.named.get("main").unwrap();
    let log = EventLog::new();
    let ctx = Rc::new(RefCell::new(bindings.new_context(None)));
    let pipeline = layout.alloc(ctx);
    pipeline.set_output(log.input());

    pipeline.input().feed(Event::data(b"ping"));
    scheduler::drain();

    assert_eq!(attempts.get(), 2, "second run consumed the capture");
    assert_eq!(log.bytes(), b"ping", "replayed data flows through");
    assert!(
        log.events().iter().all(|e| e.stream_error() != Some(StreamError::Replay)),
        "replay signal is internal"
    );
    drop(pipeline);
    scheduler::drain();
}
