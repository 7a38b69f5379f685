use std::sync::atomic::{AtomicU32, Ordering};
use wavedaq::*;

fn link() -> LinkParams {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    LinkParams {
        link_number: n,
        conet_node: 7,
        vme_base_address: 0,
    }
}

fn open(model: DigitizerModel) -> Digitizer<SimDigitizer> {
    Digitizer::open(ConnectionKind::Usb, model, link()).unwrap()
}

fn scenario_global() -> GlobalConfig {
    GlobalConfig {
        record_length: 180,
        max_events_per_read: 500,
        post_trigger_percent: 50,
        ..Default::default()
    }
}

fn all_groups() -> Vec<GroupConfig> {
    vec![GroupConfig::enabled(8); 4]
}

fn armed_scenario() -> Digitizer<SimDigitizer> {
    let mut dig = open(DigitizerModel::Dt5740d);
    dig.apply(&scenario_global(), &all_groups()).unwrap();
    dig.arm().unwrap();
    dig
}

fn trigger(dig: &mut Digitizer<SimDigitizer>, n: u32) {
    for _ in 0..n {
        dig.software_trigger().unwrap();
    }
}

#[test]
fn hundred_triggers_decode_into_full_waveforms() {
    let mut dig = armed_scenario();
    trigger(&mut dig, 100);
    assert_eq!(dig.drain(100).unwrap(), 100);
    assert_eq!(dig.decode().unwrap(), 100);
    assert_eq!(dig.event_count(), 100);

    let max = DigitizerModel::Dt5740d.constants().max_sample();
    for event in dig.events().iter() {
        assert_eq!(event.num_channels(), 32);
        assert_eq!(event.record_length(), 180);
    }
    let first = dig.event(0).unwrap();
    let waveform = first.waveform(0).unwrap();
    assert_eq!(waveform.len(), 180);
    assert!(waveform.iter().all(|&s| s <= max));
    assert_eq!(first.channels(), (0..32).collect::<Vec<_>>().as_slice());

    let all = dig.events().to_array().unwrap();
    assert_eq!(all.dim(), (100, 32, 180));
}

#[test]
fn events_keep_capture_order() {
    let mut dig = armed_scenario();
    trigger(&mut dig, 20);
    dig.drain(7).unwrap();
    dig.drain_all().unwrap();
    dig.decode().unwrap();
    let counters: Vec<u32> = dig.events().iter().map(|e| e.info.event_counter).collect();
    assert_eq!(counters, (0..20).collect::<Vec<_>>());
}

#[test]
fn drain_returns_only_what_is_pending() {
    let mut dig = armed_scenario();
    trigger(&mut dig, 10);
    assert_eq!(dig.drain(50).unwrap(), 10);
    assert_eq!(dig.events_pending().unwrap(), 0);
}

#[test]
fn pending_plus_stored_accounts_for_every_trigger() {
    for n in [0, 1, 17, 300] {
        let mut dig = armed_scenario();
        trigger(&mut dig, n);
        dig.drain(n / 2).unwrap();
        dig.decode().unwrap();
        let pending = dig.events_pending().unwrap();
        assert_eq!(pending as usize + dig.event_count(), n as usize, "{n} triggers");
        dig.drain(n).unwrap();
        dig.decode().unwrap();
        assert_eq!(dig.event_count(), n as usize);
    }
}

#[test]
fn timeout_mid_drain_loses_no_events() {
    let mut dig = open(DigitizerModel::Dt5740d);
    let global = GlobalConfig {
        max_events_per_read: 2,
        ..scenario_global()
    };
    dig.apply(&global, &all_groups()).unwrap();
    dig.arm().unwrap();
    trigger(&mut dig, 4);

    dig.connection_mut()
        .device_mut()
        .fail_read_after(1, ReturnCode::Timeout);
    assert!(dig.drain(4).is_err());
    assert!(!dig.connection().is_faulted());
    assert_eq!(dig.drain_status().retrieved, 2);
    assert_eq!(dig.events_pending().unwrap(), 2);

    assert_eq!(dig.drain(4).unwrap(), 2);
    assert_eq!(dig.decode().unwrap(), 4);
    let counters: Vec<u32> = dig.events().iter().map(|e| e.info.event_counter).collect();
    assert_eq!(counters, vec![0, 1, 2, 3]);
}

#[test]
fn links_sharing_the_low_byte_open_together() {
    let link = |link_number| LinkParams {
        link_number,
        conet_node: 9,
        vme_base_address: 0,
    };
    let first = Digitizer::<SimDigitizer>::open(ConnectionKind::Usb, DigitizerModel::Dt5740d, link(0));
    let second =
        Digitizer::<SimDigitizer>::open(ConnectionKind::Usb, DigitizerModel::Dt5740d, link(256));
    assert!(first.is_ok());
    assert!(second.is_ok());
}

#[test]
fn trigger_while_disarmed_is_rejected() {
    let mut dig = open(DigitizerModel::Dt5740d);
    dig.apply(&scenario_global(), &all_groups()).unwrap();
    let before = dig.events_pending().unwrap();
    let err = dig.software_trigger().unwrap_err();
    assert_eq!(
        err,
        DigitizerError::InvalidState {
            operation: "software_trigger",
            state: AcquisitionState::Disarmed
        }
    );
    assert_eq!(dig.events_pending().unwrap(), before);
}

#[test]
fn arm_disarm_arm_matches_single_arm() {
    let mut cycled = armed_scenario();
    cycled.disarm().unwrap();
    cycled.disarm().unwrap();
    cycled.arm().unwrap();

    let mut fresh = armed_scenario();
    assert_eq!(cycled.state(), fresh.state());
    assert_eq!(
        cycled.max_possible_buffer_depth(),
        fresh.max_possible_buffer_depth()
    );
    assert_eq!(cycled.events_pending().unwrap(), fresh.events_pending().unwrap());

    trigger(&mut cycled, 3);
    trigger(&mut fresh, 3);
    assert_eq!(cycled.drain_all().unwrap(), fresh.drain_all().unwrap());
}

#[test]
fn apply_round_trips_through_current() {
    let mut dig = open(DigitizerModel::V1740d);
    let global = GlobalConfig {
        record_length: 1024,
        post_trigger_percent: 20,
        trigger_polarity: TriggerPolarity::FallingEdge,
        buffer_full_policy: BufferFullPolicy::OverwriteOldest,
        decimation_factor: 2,
        majority_level: 3,
        majority_window: 5,
        ..Default::default()
    };
    let mut groups = GroupConfig::defaults_for(DigitizerModel::V1740d.constants());
    groups[5] = GroupConfig {
        dc_offset: 0x1234,
        trigger_threshold: 1500,
        dc_corrections: [1, 2, 3, 4, 5, 6, 7, 8],
        ..GroupConfig::enabled(3)
    };
    dig.apply(&global, &groups).unwrap();
    let current = dig.current().unwrap().unwrap();
    assert_eq!(current.global, global);
    assert_eq!(current.groups, groups);

    dig.connection_mut()
        .device_mut()
        .set_readback_supported(false);
    let cached = dig.current().unwrap().unwrap();
    assert_eq!(cached.global, global);
    assert_eq!(cached.groups, groups);
}

#[test]
fn apply_while_armed_changes_nothing() {
    let mut dig = armed_scenario();
    let other = GlobalConfig {
        record_length: 60,
        ..scenario_global()
    };
    let err = dig.apply(&other, &all_groups()).unwrap_err();
    assert!(matches!(err, DigitizerError::InvalidState { operation: "apply", .. }));
    assert_eq!(dig.cached_config().unwrap().global, scenario_global());
    assert_eq!(dig.state(), AcquisitionState::Armed);
}

#[test]
fn invalid_configuration_names_field() {
    let mut dig = open(DigitizerModel::Dt5740d);
    let mut groups = all_groups();
    groups[2].acquisition_mask = ChannelMask::none();
    let err = dig.apply(&scenario_global(), &groups).unwrap_err();
    assert_eq!(err.field(), Some("groups[2].acquisition_mask"));
    assert!(dig.cached_config().is_none());

    let err = dig.apply(&scenario_global(), &all_groups()[..3]).unwrap_err();
    assert_eq!(err.field(), Some("groups"));
}

#[test]
fn clear_resets_counts() {
    let mut dig = armed_scenario();
    trigger(&mut dig, 30);
    dig.drain(10).unwrap();
    dig.decode().unwrap();
    dig.drain(5).unwrap();
    dig.clear().unwrap();
    assert_eq!(dig.event_count(), 0);
    assert_eq!(dig.events_pending().unwrap(), 0);
    assert_eq!(dig.drain_status().retrieved, 0);
}

#[test]
fn decode_is_repeatable_on_the_same_buffer() {
    let mut dig = armed_scenario();
    trigger(&mut dig, 5);
    dig.drain_all().unwrap();
    let raw = dig.take_raw();
    let first = dig.decode_preview(&raw).unwrap();
    let second = dig.decode_preview(&raw).unwrap();
    assert_eq!(first, second);
    assert_eq!(dig.decode_buffer(raw).unwrap(), 5);
    assert_eq!(dig.event(4).unwrap(), &first[4]);
}

#[test]
fn malformed_buffer_leaves_store_untouched() {
    let mut dig = armed_scenario();
    trigger(&mut dig, 2);
    dig.drain_all().unwrap();
    dig.decode().unwrap();

    trigger(&mut dig, 3);
    dig.drain_all().unwrap();
    let raw = dig.take_raw();
    let mut bytes = raw.bytes().to_vec();
    bytes.truncate(bytes.len() - 2);
    let err = dig
        .decode_buffer(RawEventBuffer::new(bytes, raw.event_count()))
        .unwrap_err();
    assert!(matches!(err, DigitizerError::Decode(_)));
    assert_eq!(dig.event_count(), 2);
}

#[test]
fn out_of_range_index() {
    let mut dig = armed_scenario();
    trigger(&mut dig, 1);
    dig.drain_all().unwrap();
    dig.decode().unwrap();
    assert_eq!(
        dig.event(1).unwrap_err(),
        DigitizerError::Index { index: 1, len: 1 }
    );
}

#[test]
fn stall_policy_keeps_oldest_events() {
    let mut dig = open(DigitizerModel::Dt5740d);
    let global = GlobalConfig {
        record_length: 1500,
        buffer_full_policy: BufferFullPolicy::Stall,
        ..Default::default()
    };
    dig.apply(&global, &all_groups()).unwrap();
    // 128 buffers, one kept free
    assert_eq!(dig.max_possible_buffer_depth(), 127);
    dig.arm().unwrap();
    trigger(&mut dig, 130);
    assert_eq!(dig.events_pending().unwrap(), 127);
    assert_eq!(dig.lost_triggers().unwrap(), Some(3));
    dig.drain_all().unwrap();
    dig.decode().unwrap();
    assert_eq!(dig.event(0).unwrap().info.event_counter, 0);
}

#[test]
fn overwrite_policy_keeps_newest_events() {
    let mut dig = open(DigitizerModel::Dt5740d);
    let global = GlobalConfig {
        record_length: 1500,
        buffer_full_policy: BufferFullPolicy::OverwriteOldest,
        memory_full_mode: MemoryFullMode::Normal,
        ..Default::default()
    };
    dig.apply(&global, &all_groups()).unwrap();
    assert_eq!(dig.max_possible_buffer_depth(), 128);
    dig.arm().unwrap();
    trigger(&mut dig, 130);
    assert_eq!(dig.events_pending().unwrap(), 128);
    assert_eq!(dig.lost_triggers().unwrap(), Some(2));
    dig.drain_all().unwrap();
    dig.decode().unwrap();
    assert_eq!(dig.event(0).unwrap().info.event_counter, 2);
    assert_eq!(dig.event(127).unwrap().info.event_counter, 129);
}

#[test]
fn device_fault_is_sticky() {
    let mut dig = armed_scenario();
    trigger(&mut dig, 4);
    dig.connection_mut()
        .device_mut()
        .inject_fault(ReturnCode::CommError);
    let err = dig.drain(4).unwrap_err();
    assert!(matches!(
        err,
        DigitizerError::Device {
            code: ReturnCode::CommError,
            ..
        }
    ));
    assert!(dig.events_pending().is_err());
    assert!(dig.software_trigger().is_err());
    // always safe, even on a dead connection
    dig.disarm().unwrap();
    assert_eq!(dig.state(), AcquisitionState::Disarmed);
}

#[test]
fn ungrouped_model_exposes_one_group_per_channel() {
    let mut dig = open(DigitizerModel::Dt5730b);
    let mut groups = GroupConfig::defaults_for(DigitizerModel::Dt5730b.constants());
    groups[1] = GroupConfig::enabled(1);
    groups[6] = GroupConfig::enabled(1);
    let global = GlobalConfig {
        record_length: 40,
        ..Default::default()
    };
    dig.apply(&global, &groups).unwrap();
    dig.arm().unwrap();
    trigger(&mut dig, 2);
    dig.drain_all().unwrap();
    dig.decode().unwrap();
    let event = dig.event(1).unwrap();
    assert_eq!(event.channels(), &[1, 6]);
    assert_eq!(event.info.group_mask, 0b0100_0010);
    assert!(event.channel(6).unwrap().iter().all(|&s| s <= 16383));
}

#[test]
fn second_open_of_same_link_fails() {
    let shared = link();
    let _first = Digitizer::<SimDigitizer>::open(ConnectionKind::Usb, DigitizerModel::Dt5740d, shared)
        .unwrap();
    let second =
        Digitizer::<SimDigitizer>::open(ConnectionKind::Usb, DigitizerModel::Dt5740d, shared);
    assert!(matches!(
        second,
        Err(DigitizerError::Device {
            code: ReturnCode::DigitizerAlreadyOpen,
            ..
        })
    ));
    // a different connection kind is a different attachment
    assert!(
        Digitizer::<SimDigitizer>::open(ConnectionKind::A4818, DigitizerModel::Dt5740d, shared)
            .is_ok()
    );
}

#[test]
fn dropping_an_armed_digitizer_frees_the_link() {
    let shared = link();
    {
        let mut dig =
            Digitizer::<SimDigitizer>::open(ConnectionKind::Usb, DigitizerModel::Dt5740d, shared)
                .unwrap();
        dig.apply(&scenario_global(), &all_groups()).unwrap();
        dig.arm().unwrap();
    }
    assert!(
        Digitizer::<SimDigitizer>::open(ConnectionKind::Usb, DigitizerModel::Dt5740d, shared)
            .is_ok()
    );
}
