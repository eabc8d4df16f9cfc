//! A LIN-like trivial bus built entirely on the generic pub/sub flow: the
//! frame layout, checksum rule, and master/slave response tables live in
//! this test, the way a bus-simulation collaborator would layer them on
//! the middleware.
//!
//! Master schedules frame sends for ids 16, 17, 18, 19 and 34, then goes
//! to sleep (id 60). The slave is configured with a receive entry for 16,
//! nothing for 17, a mismatched checksum rule for 18, a mismatched length
//! for 19, and an unconditional transmit for 34.

mod common;

use common::{wait_until, PROPAGATION};
use parking_lot::Mutex;
use silbus_participant::{Participant, ParticipantConfig, PubSubSpec};
use silbus_registry::Registry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const GO_TO_SLEEP_ID: u8 = 60;

/// Frame status as counted by both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FrameStatus {
    RxOk,
    RxError,
    TxOk,
}

/// `[id][len][data...][checksum]`
fn encode_frame(id: u8, data: &[u8], checksum: u8) -> Vec<u8> {
    let mut raw = Vec::with_capacity(3 + data.len());
    raw.push(id);
    raw.push(data.len() as u8);
    raw.extend_from_slice(data);
    raw.push(checksum);
    raw
}

fn decode_frame(raw: &[u8]) -> Option<(u8, &[u8], u8)> {
    if raw.len() < 3 {
        return None;
    }
    let id = raw[0];
    let len = raw[1] as usize;
    if raw.len() != 3 + len {
        return None;
    }
    Some((id, &raw[2..2 + len], raw[2 + len]))
}

fn classic_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// The slave's configured reaction per frame id.
#[derive(Clone)]
enum SlaveResponse {
    /// Receive with this expected length; `checksum_bias` models a
    /// mismatched checksum configuration between the two nodes.
    Rx { expected_len: usize, checksum_bias: u8 },
    /// Respond with this payload when the master sends the header.
    TxUnconditional { data: Vec<u8> },
}

#[test]
fn lin_like_master_slave_frame_exchange() {
    let registry = Registry::start("silkit://127.0.0.1:0").expect("registry");

    // ─── Slave ───

    let slave_participant =
        Participant::connect(ParticipantConfig::default(), "Slave", registry.uri())
            .expect("slave joins");
    let slave_tx = slave_participant
        .create_data_publisher("SlaveTx", &PubSubSpec::new("LIN_1/slave"), 0)
        .expect("slave tx");
    let slave_counts: Arc<Mutex<HashMap<FrameStatus, usize>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let mut response_table: HashMap<u8, SlaveResponse> = HashMap::new();
    response_table.insert(16, SlaveResponse::Rx { expected_len: 8, checksum_bias: 0 });
    // id 17 stays unconfigured (unused).
    response_table.insert(18, SlaveResponse::Rx { expected_len: 8, checksum_bias: 1 });
    response_table.insert(19, SlaveResponse::Rx { expected_len: 8, checksum_bias: 0 });
    response_table.insert(
        34,
        SlaveResponse::TxUnconditional {
            data: vec![3, 4, 3, 4, 3, 4, 3, 4],
        },
    );
    response_table.insert(GO_TO_SLEEP_ID, SlaveResponse::Rx { expected_len: 1, checksum_bias: 0 });

    let slave_tx = Arc::new(slave_tx);
    let _slave_rx = {
        let counts = Arc::clone(&slave_counts);
        let responses = response_table.clone();
        let slave_tx = Arc::clone(&slave_tx);
        slave_participant
            .create_data_subscriber(
                "SlaveRx",
                &PubSubSpec::new("LIN_1/master"),
                Arc::new(move |event| {
                    let Some((id, data, checksum)) = decode_frame(&event.data) else {
                        return;
                    };
                    match responses.get(&id) {
                        None => {} // unused id, no reaction
                        Some(SlaveResponse::Rx { expected_len, checksum_bias }) => {
                            let expected =
                                classic_checksum(data).wrapping_add(*checksum_bias);
                            let status = if data.len() == *expected_len && checksum == expected
                            {
                                FrameStatus::RxOk
                            } else {
                                FrameStatus::RxError
                            };
                            *counts.lock().entry(status).or_insert(0) += 1;
                        }
                        Some(SlaveResponse::TxUnconditional { data }) => {
                            slave_tx.publish(&encode_frame(
                                id,
                                data,
                                classic_checksum(data),
                            ));
                            *counts.lock().entry(FrameStatus::TxOk).or_insert(0) += 1;
                        }
                    }
                }),
            )
            .expect("slave rx")
    };

    // ─── Master ───

    let master_participant =
        Participant::connect(ParticipantConfig::default(), "Master", registry.uri())
            .expect("master joins");
    let master_tx = master_participant
        .create_data_publisher("MasterTx", &PubSubSpec::new("LIN_1/master"), 0)
        .expect("master tx");

    let master_rx_frames: Arc<Mutex<Vec<(u8, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let master_counts: Arc<Mutex<HashMap<FrameStatus, usize>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let _master_rx = {
        let frames = Arc::clone(&master_rx_frames);
        let counts = Arc::clone(&master_counts);
        master_participant
            .create_data_subscriber(
                "MasterRx",
                &PubSubSpec::new("LIN_1/slave"),
                Arc::new(move |event| {
                    if let Some((id, data, _)) = decode_frame(&event.data) {
                        frames.lock().push((id, data.to_vec()));
                        *counts.lock().entry(FrameStatus::RxOk).or_insert(0) += 1;
                    }
                }),
            )
            .expect("master rx")
    };

    // Let both subscriptions attach before the schedule runs.
    std::thread::sleep(Duration::from_millis(500));

    // The master's schedule: five frame sends, then go to sleep.
    let payload = [1u8, 6, 1, 6, 1, 6, 1, 6];
    for (id, data, checksum) in [
        (16u8, &payload[..], classic_checksum(&payload)),
        (17, &payload[..], classic_checksum(&payload)),
        // Checksum computed under the master's rule; the slave's rule for
        // 18 differs, so the slave sees a mismatch.
        (18, &payload[..], classic_checksum(&payload)),
        // Four bytes where the slave expects eight.
        (19, &payload[..4], classic_checksum(&payload[..4])),
        (34, &[][..], 0),
        (GO_TO_SLEEP_ID, &[0u8][..], classic_checksum(&[0])),
    ] {
        master_tx.publish(&encode_frame(id, data, checksum));
        // The trivial bus confirms every master data transmission; id 34
        // is a header (the slave transmits) and go-to-sleep is a command.
        if (16..=19).contains(&id) {
            *master_counts.lock().entry(FrameStatus::TxOk).or_insert(0) += 1;
        }
    }

    // ─── Expectations ───

    assert!(
        wait_until(PROPAGATION, || {
            let counts = slave_counts.lock();
            counts.get(&FrameStatus::RxOk).copied().unwrap_or(0) >= 2
                && counts.get(&FrameStatus::RxError).copied().unwrap_or(0) >= 2
                && counts.get(&FrameStatus::TxOk).copied().unwrap_or(0) >= 1
        }),
        "slave processed the schedule: {:?}",
        slave_counts.lock()
    );
    {
        let counts = slave_counts.lock();
        assert_eq!(counts.get(&FrameStatus::RxOk), Some(&2), "id 16 and go-to-sleep");
        assert_eq!(counts.get(&FrameStatus::RxError), Some(&2), "ids 18 and 19");
        assert_eq!(counts.get(&FrameStatus::TxOk), Some(&1), "id 34");
    }

    assert!(
        wait_until(PROPAGATION, || !master_rx_frames.lock().is_empty()),
        "master received the slave's response"
    );
    {
        let frames = master_rx_frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 34);
        assert_eq!(frames[0].1, vec![3, 4, 3, 4, 3, 4, 3, 4]);
    }
    assert_eq!(
        master_counts.lock().get(&FrameStatus::TxOk),
        Some(&4),
        "master confirmed transmissions for ids 16..=19"
    );
}
