//! Late-join recovery: a subscriber that matches a history-1 publisher
//! after the fact receives exactly the most recent retained message, then
//! the live stream.

mod common;

use common::{wait_until, PROPAGATION};
use parking_lot::Mutex;
use silbus_participant::{Participant, ParticipantConfig, PubSubSpec};
use silbus_registry::Registry;
use std::sync::Arc;

#[test]
fn late_subscriber_receives_the_retained_message_then_live_traffic() {
    let registry = Registry::start("silkit://127.0.0.1:0").expect("registry");

    let publisher_participant =
        Participant::connect(ParticipantConfig::default(), "Publisher", registry.uri())
            .expect("publisher joins");
    let publisher = publisher_participant
        .create_data_publisher("Pub", &PubSubSpec::new("Retained"), 1)
        .expect("create publisher");

    // Both published before anyone subscribes; only the latest is retained.
    publisher.publish(&[1]);
    publisher.publish(&[2]);

    let subscriber_participant =
        Participant::connect(ParticipantConfig::default(), "Subscriber", registry.uri())
            .expect("subscriber joins");
    let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let sink = Arc::clone(&received);
    let _subscriber = subscriber_participant
        .create_data_subscriber(
            "Sub",
            &PubSubSpec::new("Retained"),
            Arc::new(move |event| sink.lock().push(event.data.clone())),
        )
        .expect("create subscriber");

    assert!(
        wait_until(PROPAGATION, || !received.lock().is_empty()),
        "retained message replayed"
    );
    assert_eq!(
        received.lock().clone(),
        vec![vec![2]],
        "exactly the most recent retained message, not the older one"
    );

    publisher.publish(&[3]);
    assert!(
        wait_until(PROPAGATION, || received.lock().len() >= 2),
        "live message after the replay"
    );
    assert_eq!(received.lock().clone(), vec![vec![2], vec![3]]);
}

#[test]
fn history_depth_above_one_is_rejected() {
    let registry = Registry::start("silkit://127.0.0.1:0").expect("registry");
    let participant =
        Participant::connect(ParticipantConfig::default(), "Publisher", registry.uri())
            .expect("publisher joins");
    assert!(participant
        .create_data_publisher("Pub", &PubSubSpec::new("Deep"), 2)
        .is_err());
}
