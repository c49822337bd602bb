//! Multi-node scenarios driven against the actual wire encoding through a
//! shared in-memory medium, rather than against a single scheduler's mocked
//! loopback radio.
mod support;

use shelfos::clock::{LocalTime, RefClock};
use shelfos::discovery::Resolution;
use shelfos::identity::{NodeId, Secret};
use shelfos::peripheral::MockHost;
use shelfos::rpc::CallResult;
use shelfos::scheduler::Scheduler;

use support::Hub;

const SWARM_SECRET: &str = "0123456789abcdef0123456789abcdef";

fn enrolled(id: &str) -> Scheduler {
    let mut scheduler = Scheduler::new(
        NodeId::new(id),
        format!("node-{id}"),
        RefClock::new(LocalTime::from_millis(0)),
    );
    scheduler.set_swarm_secret(Secret::from_raw(SWARM_SECRET));
    scheduler
}

#[test]
fn announce_reaches_every_other_node_on_the_medium() {
    let hub = Hub::new();
    let mut oven = enrolled("oven");
    let mut fridge = enrolled("fridge");
    let mut kettle = enrolled("kettle");

    let oven_host = MockHost::new().attach("oven_relay_0", "switch", ["toggle"]);
    oven.rescan(&oven_host);

    let mut oven_radio = hub.radio_for(0);
    let mut fridge_radio = hub.radio_for(1);
    let mut kettle_radio = hub.radio_for(2);

    oven.tick(&mut oven_radio);

    let empty_host = MockHost::new();
    while let Some(frame) = fridge_radio.try_recv() {
        fridge.on_receive(&empty_host, &frame);
    }
    while let Some(frame) = kettle_radio.try_recv() {
        kettle.on_receive(&empty_host, &frame);
    }

    assert_eq!(
        fridge.discovery().resolve("oven_relay_0", fridge.local_peripherals()),
        Resolution::Remote(NodeId::new("oven"))
    );
    assert_eq!(
        kettle.discovery().resolve("oven_relay_0", kettle.local_peripherals()),
        Resolution::Remote(NodeId::new("oven"))
    );
    // The broadcasting node never sees its own frame echoed back.
    assert!(oven_radio.try_recv().is_none());
}

#[test]
fn call_and_result_round_trip_across_the_medium() {
    let hub = Hub::new();
    let mut caller = enrolled("panel");
    let mut callee = enrolled("oven");

    let callee_host = MockHost::new().attach("oven_relay_0", "switch", ["toggle"]);
    callee.rescan(&callee_host);

    let mut caller_radio = hub.radio_for(0);
    let mut callee_radio = hub.radio_for(1);

    let (request_id, call_payload) = caller
        .rpc_client_mut()
        .call(NodeId::new("oven"), "oven_relay_0", "toggle", vec![], 0);
    caller.send(&mut caller_radio, &call_payload);

    let caller_host = MockHost::new();
    let mut reaction = None;
    while let Some(frame) = callee_radio.try_recv() {
        let r = callee.on_receive(&caller_host, &frame);
        for payload in &r.to_send {
            callee.send(&mut callee_radio, payload);
        }
        reaction = Some(r);
    }
    assert!(reaction.is_some());

    let mut resolved = None;
    while let Some(frame) = caller_radio.try_recv() {
        let r = caller.on_receive(&callee_host, &frame);
        if let Some(pair) = r.resolved_call {
            resolved = Some(pair);
        }
    }

    let (resolved_id, outcome) = resolved.expect("RESULT frame resolved the pending call");
    assert_eq!(resolved_id, request_id);
    assert_eq!(outcome, CallResult::Ok(vec![shelfos::codec::Value::Int(500_000)]));
}

#[test]
fn discover_prompts_every_peer_to_reannounce() {
    let hub = Hub::new();
    let mut asker = enrolled("panel");
    let mut responder_a = enrolled("oven");
    let mut responder_b = enrolled("fridge");

    let host_a = MockHost::new().attach("oven_relay_0", "switch", ["toggle"]);
    responder_a.rescan(&host_a);
    let host_b = MockHost::new().attach("fridge_sensor_0", "thermometer", ["getTemp"]);
    responder_b.rescan(&host_b);

    let mut asker_radio = hub.radio_for(0);
    let mut a_radio = hub.radio_for(1);
    let mut b_radio = hub.radio_for(2);

    let discover_payload = asker.discovery().discover_payload();
    asker.send(&mut asker_radio, &discover_payload);

    let empty_host = MockHost::new();
    while let Some(frame) = a_radio.try_recv() {
        let reaction = responder_a.on_receive(&empty_host, &frame);
        for payload in &reaction.to_send {
            responder_a.send(&mut a_radio, payload);
        }
    }
    while let Some(frame) = b_radio.try_recv() {
        let reaction = responder_b.on_receive(&empty_host, &frame);
        for payload in &reaction.to_send {
            responder_b.send(&mut b_radio, payload);
        }
    }

    while let Some(frame) = a_radio.try_recv() {
        asker.on_receive(&empty_host, &frame);
    }
    while let Some(frame) = b_radio.try_recv() {
        asker.on_receive(&empty_host, &frame);
    }

    assert_eq!(
        asker.discovery().resolve("oven_relay_0", asker.local_peripherals()),
        Resolution::Remote(NodeId::new("oven"))
    );
    assert_eq!(
        asker.discovery().resolve("fridge_sensor_0", asker.local_peripherals()),
        Resolution::Remote(NodeId::new("fridge"))
    );
}
