mod simulator;

use core::time::Duration;
use ethercore::{Master, MasterConfig, Stage, AlState, EthercatError, Port};
use simulator::{Segment, SlaveConfig, BrokenSocket};

const TIMEOUT: Duration = Duration::from_millis(100);

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn dense_addresses() {
    init();
    let segment = Segment::new(vec![
        SlaveConfig::new(2, 2),
        SlaveConfig::new(1, 0).unnamed(),
        SlaveConfig::new(0, 4),
        ]);
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    assert_eq!(master.stage(), Stage::Open);
    assert_eq!(master.configure().await.unwrap(), 3);
    assert_eq!(master.stage(), Stage::Configured);

    let slaves = master.slaves();
    assert_eq!(slaves.len(), 3);
    for (position, slave) in slaves.iter().enumerate() {
        let station = position as u16 + 1;
        assert_eq!(slave.position, position as u16);
        assert_eq!(slave.station, station);
        assert_eq!(segment.memory(position, 0x10, 2), station.to_le_bytes());
        assert_eq!(slave.state, AlState::Init);
        assert!(! slave.degraded);
        assert!(slave.dc);
        assert!(slave.has_mailbox());
    }
    assert_eq!(slaves[0].name, "SIM-IO");
    assert_eq!(slaves[1].name, "? M:00000abc I:00010100");
    assert_eq!(slaves[0].vendor, 0xabc);
    assert_eq!(slaves[2].product, 0x0001_0004);
    assert_eq!(slaves[0].serial, 0x1234);
    assert_eq!((slaves[0].output_bits, slaves[0].input_bits), (16, 16));
    assert_eq!((slaves[1].output_bits, slaves[1].input_bits), (8, 0));
    assert_eq!((slaves[2].output_bits, slaves[2].input_bits), (0, 32));
    assert_eq!(slaves[0].mailbox_write, (0x1000, 128));
    assert_eq!(slaves[0].mailbox_read, (0x1080, 128));
    assert!(slaves[0].protocols.can());
    assert!(slaves[0].protocols.servo());
    assert_eq!(slaves.iter().map(|slave| slave.parent).collect::<Vec<_>>(), [None, Some(0), Some(1)]);
    assert_eq!(master.slave(2).unwrap().name, slaves[1].name);
    assert!(matches!(master.slave(4), Err(EthercatError::Master(_))));
    assert!(matches!(master.slave(0), Err(EthercatError::Master(_))));
}

#[tokio::test]
async fn empty_segment() {
    init();
    let segment = Segment::new(Vec::new());
    let mut master = Master::open(segment, MasterConfig::default());
    assert!(matches!(master.configure().await, Err(EthercatError::NoSlaves)));
    assert_eq!(master.stage(), Stage::Open);
    assert!(matches!(master.slave(1), Err(EthercatError::Master(_))));
}

#[tokio::test]
async fn unreadable_eeprom() {
    init();
    let segment = Segment::new(vec![
        SlaveConfig::new(2, 2),
        SlaveConfig::new(2, 2).broken_eeprom(),
        ]);
    let mut master = Master::open(segment, MasterConfig::default());
    assert_eq!(master.configure().await.unwrap(), 2);

    let slave = master.slave(2).unwrap();
    assert!(slave.degraded);
    assert_eq!(slave.name, "? M:00000000 I:00000000");
    assert_eq!((slave.vendor, slave.product), (0, 0));
    assert!(! slave.has_mailbox());
    assert_eq!(slave.output_bits + slave.input_bits, 0);
    assert!(! master.slave(1).unwrap().degraded);
}

#[tokio::test]
async fn reconfigure_forgets() {
    init();
    let segment = Segment::uniform(2, SlaveConfig::new(2, 2));
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    master.configure().await.unwrap();
    master.request_state_all(AlState::PreOperational, TIMEOUT).await.unwrap();
    master.set_group(2, 3).unwrap();

    assert_eq!(master.configure().await.unwrap(), 2);
    assert_eq!(segment.al_state(0), 1);
    assert_eq!(master.slave(2).unwrap().group, 0);
    assert_eq!(master.slave(2).unwrap().state, AlState::Init);
}

#[tokio::test]
async fn closed_segment() {
    init();
    let segment = Segment::uniform(2, SlaveConfig::new(2, 2));
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    master.configure().await.unwrap();
    master.close();
    assert_eq!(master.stage(), Stage::Closed);
    assert!(master.slaves().is_empty());

    let sent = segment.sent();
    assert!(matches!(master.configure().await, Err(EthercatError::Master(_))));
    assert!(matches!(master.slave(1), Err(EthercatError::Master(_))));
    assert!(matches!(master.read_state().await, Err(EthercatError::Master(_))));
    let mut data = [0; 2];
    assert!(matches!(master.aprd(0, 0x10, &mut data, TIMEOUT).await, Err(EthercatError::Master(_))));
    assert_eq!(segment.sent(), sent);
    // closing again is harmless
    master.close();
}

#[tokio::test]
async fn eeprom_access() {
    init();
    let segment = Segment::uniform(1, SlaveConfig::new(2, 2));
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    master.configure().await.unwrap();

    // vendor then product
    let identity = master.eeprom_read(1, 0x08, 8, TIMEOUT).await.unwrap();
    assert_eq!(identity, [0xbc, 0x0a, 0, 0, 0x02, 0x02, 0x01, 0x00]);
    // odd sizes are truncated
    assert_eq!(master.eeprom_read(1, 0x08, 3, TIMEOUT).await.unwrap(), [0xbc, 0x0a, 0]);

    master.eeprom_write(1, 0x100, &[0x12, 0x34, 0x56, 0x78], TIMEOUT).await.unwrap();
    assert_eq!(segment.eeprom_word(0, 0x100), 0x3412);
    assert_eq!(segment.eeprom_word(0, 0x101), 0x7856);
    assert_eq!(master.eeprom_read(1, 0x100, 4, TIMEOUT).await.unwrap(), [0x12, 0x34, 0x56, 0x78]);

    assert!(matches!(master.eeprom_write(1, 0x100, &[1, 2, 3], TIMEOUT).await, Err(EthercatError::Master(_))));
    assert!(matches!(master.eeprom_read(2, 0, 2, TIMEOUT).await, Err(EthercatError::Master(_))));
}

#[tokio::test]
async fn redundancy_failover() {
    init();
    let segment = Segment::uniform(2, SlaveConfig::new(2, 2));
    let mut master = Master::open_redundant(BrokenSocket, segment.clone(), MasterConfig::default());
    assert_eq!(master.redundancy(), Some(Port::Primary));
    assert_eq!(master.configure().await.unwrap(), 2);
    assert_eq!(master.redundancy(), Some(Port::Secondary));
    assert_eq!(master.slaves()[1].station, 2);

    let plain = Master::open(segment, MasterConfig::default());
    assert_eq!(plain.redundancy(), None);
}
