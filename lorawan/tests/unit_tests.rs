use lorawan::{
    config::{
        device::{AESKey, DevAddr},
        DeviceConfig, MacConfig, Session, SessionKeys,
    },
    lorawan::{
        frame::CfList,
        region::{Au915, ChannelPlan},
    },
    storage::{PersistedSession, SessionStore, VolatileStore, PERSISTED_SIZE},
};

#[test]
fn test_otaa_config() {
    let dev_eui = [0x01; 8];
    let app_eui = [0x02; 8];
    let app_key = AESKey::new([0x03; 16]);

    let config = DeviceConfig::new_otaa(dev_eui, app_eui, app_key);

    assert_eq!(&config.dev_eui, &dev_eui);
    assert_eq!(&config.app_eui, &app_eui);
    assert_eq!(config.app_key.as_bytes(), &[0x03; 16]);
    assert!(config.abp_session().is_none());
}

#[test]
fn test_abp_config() {
    let dev_addr = DevAddr::new([0x04, 0x03, 0x02, 0x01]);
    let config = DeviceConfig::new_abp(dev_addr, AESKey::new([0x01; 16]), AESKey::new([0x02; 16]));

    let (addr, nwk_skey, app_skey) = config.abp_session().unwrap();
    assert_eq!(addr.to_u32(), 0x0102_0304);
    assert_eq!(nwk_skey.as_bytes(), &[0x01; 16]);
    assert_eq!(app_skey.as_bytes(), &[0x02; 16]);
}

#[test]
fn test_session_counters() {
    let keys = SessionKeys {
        nwk_skey: AESKey::new([0x01; 16]),
        app_skey: AESKey::new([0x02; 16]),
    };
    let mut session = Session::new(DevAddr::from_u32(1), keys, 923_300_000, 8, 2);

    assert_eq!(session.next_fcnt_up(), 0);
    assert_eq!(session.next_fcnt_up(), 1);
    assert_eq!(session.fcnt_up, 2);
    assert_eq!(session.fcnt_down, None);
    session.accept_fcnt_down(7);
    assert_eq!(session.fcnt_down, Some(7));
    assert_eq!(session.rx1_delay, 1);
    assert_eq!(session.nb_trans, 1);
}

#[test]
fn test_au915_rx1_frequencies() {
    let plan = Au915::default();
    for index in 0..72 {
        let channel = Au915::channel(index).unwrap();
        let expected = 923_300_000 + 600_000 * (index as u32 % 8);
        assert_eq!(plan.rx1_frequency(&channel), expected);
    }
    assert!(Au915::channel(72).is_none());
}

#[test]
fn test_au915_rx1_data_rates() {
    let plan = Au915::default();
    assert_eq!(plan.rx1_data_rate(2, 0), 10);
    assert_eq!(plan.rx1_data_rate(5, 1), 12);
    assert_eq!(plan.rx1_data_rate(2, 5), 8);
    assert_eq!(plan.rx1_data_rate(6, 0), 13);
    assert_eq!(plan.rx2_default(), (923_300_000, 8));
}

#[test]
fn test_au915_dwell_time_switch() {
    let mut plan = Au915::default();
    assert_eq!(plan.max_payload(2), Some(19));
    assert_eq!(plan.max_payload(0), None);
    assert_eq!(plan.max_airtime_us(), Some(400_000));
    assert_eq!(plan.lower_data_rate(2), None);

    plan.set_tx_params(false, 30);
    assert_eq!(plan.max_payload(2), Some(59));
    assert_eq!(plan.max_payload(0), Some(59));
    assert_eq!(plan.max_airtime_us(), None);
    assert_eq!(plan.lower_data_rate(2), Some(1));
}

#[test]
fn test_au915_cf_list_mask() {
    let mut plan = Au915::default();
    plan.apply_cf_list(&CfList::ChannelMask([0x00FF, 0, 0, 0, 0x0001]));

    let mask = plan.channel_mask();
    assert_eq!(mask.count(), 9);
    assert!((0..8).all(|ch| mask.is_enabled(ch)));
    assert!(mask.is_enabled(64));
    assert!(!mask.is_enabled(8));
}

#[test]
fn test_sub_band_selection() {
    let mut plan = Au915::default();
    plan.enable_sub_band(2).unwrap();

    let mask = plan.channel_mask();
    assert_eq!(mask.count(), 9);
    assert!((8..16).all(|ch| mask.is_enabled(ch)));
    assert!(mask.is_enabled(65));
    assert!(plan.enable_sub_band(9).is_err());
    assert_eq!(MacConfig::default().sub_band, Some(2));
}

#[test]
fn test_volatile_store() {
    let mut store = VolatileStore;
    let keys = SessionKeys {
        nwk_skey: AESKey::new([0x01; 16]),
        app_skey: AESKey::new([0x02; 16]),
    };
    let record = PersistedSession {
        session: Some(Session::new(DevAddr::from_u32(9), keys, 923_300_000, 8, 2)),
        dev_nonce: 3,
        channel_mask: Au915::default().channel_mask(),
    }
    .to_bytes();

    store.save(&record).unwrap();
    let mut buf = [0u8; PERSISTED_SIZE];
    assert_eq!(store.load(&mut buf), Ok(false));
    assert!(PersistedSession::from_bytes(&record).is_some());
}
