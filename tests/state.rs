mod simulator;

use core::time::Duration;
use ethercore::{Master, MasterConfig, AlState, AlError, EthercatError, Event};
use simulator::{Segment, SlaveConfig};

const TIMEOUT: Duration = Duration::from_millis(100);

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn mapping_before_safeop() {
    init();
    let segment = Segment::uniform(1, SlaveConfig::new(2, 2));
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    master.configure().await.unwrap();
    assert_eq!(master.request_state(1, AlState::PreOperational, TIMEOUT).await.unwrap(), AlState::PreOperational);
    assert!(matches!(
        master.request_state(1, AlState::SafeOperational, TIMEOUT).await,
        Err(EthercatError::Master(_)),
        ));
    assert_eq!(segment.al_state(0), 2);

    master.map().await.unwrap();
    assert_eq!(master.request_state(1, AlState::SafeOperational, TIMEOUT).await.unwrap(), AlState::SafeOperational);
    assert_eq!(segment.al_state(0), 4);
}

#[tokio::test]
async fn refused_transition() {
    init();
    let segment = Segment::uniform(1, SlaveConfig::new(0, 0));
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    master.configure().await.unwrap();

    // no process data, so the master lets the request go, but the slave refuses to skip states
    let result = master.request_state(1, AlState::Operational, TIMEOUT).await;
    assert!(matches!(result, Err(EthercatError::Slave(_, AlError::InvalidRequestedStateChange))));
    let slave = master.slave(1).unwrap();
    assert!(slave.error);
    assert_eq!(slave.state, AlState::Init);
    assert_eq!(slave.status_code, AlError::InvalidRequestedStateChange);
    assert_eq!(master.diagnostics().last().unwrap().event,
        Event::AlStatus {state: AlState::Init, code: AlError::InvalidRequestedStateChange});

    // the error is acknowledged before the next request
    assert_eq!(master.request_state(1, AlState::PreOperational, TIMEOUT).await.unwrap(), AlState::PreOperational);
    assert!(! master.slave(1).unwrap().error);
    assert_eq!(segment.memory(0, 0x130, 1), [2]);

    assert!(matches!(
        master.request_state(1, AlState::Bootstrap, TIMEOUT).await,
        Err(EthercatError::Slave(_, AlError::BootstrapNotSupported)),
        ));
}

#[tokio::test]
async fn segment_state() {
    init();
    let segment = Segment::uniform(2, SlaveConfig::new(0, 0));
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    master.configure().await.unwrap();
    assert_eq!(master.read_state().await.unwrap(), AlState::Init);

    master.write_state(2, AlState::PreOperational).await.unwrap();
    assert_eq!(master.slave(2).unwrap().requested, AlState::PreOperational);
    assert_eq!(master.state_check(2, AlState::PreOperational, TIMEOUT).await.unwrap(), AlState::PreOperational);
    // lowest state of the segment
    assert_eq!(master.read_state().await.unwrap(), AlState::Init);

    master.write_state_all(AlState::PreOperational).await.unwrap();
    assert_eq!(master.read_state().await.unwrap(), AlState::PreOperational);
    // the state stays the same when nothing was requested
    assert_eq!(master.state_check(1, AlState::Operational, Duration::from_millis(20)).await.unwrap(), AlState::PreOperational);

    segment.set_silent(1, true);
    assert_eq!(master.read_state().await.unwrap(), AlState::Unknown);
    assert_eq!(master.slave(2).unwrap().state, AlState::Unknown);
    assert_eq!(master.slave(1).unwrap().state, AlState::PreOperational);
}

#[tokio::test]
async fn best_effort_all() {
    init();
    let segment = Segment::new(vec![
        SlaveConfig::new(0, 0),
        SlaveConfig::new(0, 0).without_mailbox(),
        ]);
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    master.configure().await.unwrap();
    // a slave refusing does not stop the others
    assert_eq!(master.request_state_all(AlState::Operational, TIMEOUT).await.unwrap(), AlState::Init);
    assert_eq!(master.request_state_all(AlState::PreOperational, TIMEOUT).await.unwrap(), AlState::PreOperational);
    assert_eq!(segment.al_state(1), 2);
    assert_eq!(master.request_state_all(AlState::SafeOperational, TIMEOUT).await.unwrap(), AlState::SafeOperational);
    assert_eq!(master.request_state_all(AlState::Operational, TIMEOUT).await.unwrap(), AlState::Operational);
}

#[tokio::test]
async fn power_cycle_recovery() {
    init();
    let segment = Segment::uniform(3, SlaveConfig::new(2, 2));
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    master.configure().await.unwrap();
    master.request_state_all(AlState::PreOperational, TIMEOUT).await.unwrap();
    master.map().await.unwrap();
    master.request_state_all(AlState::SafeOperational, TIMEOUT).await.unwrap();
    master.request_state_all(AlState::Operational, TIMEOUT).await.unwrap();
    assert_eq!(master.exchange(TIMEOUT).await.unwrap(), 9);

    segment.power_cycle(1);
    assert_eq!(master.exchange(TIMEOUT).await.unwrap(), 6);
    assert_eq!(master.read_state().await.unwrap(), AlState::Unknown);

    assert_eq!(master.recover(2, Duration::from_secs(1)).await.unwrap(), AlState::Operational);
    assert_eq!(segment.memory(1, 0x10, 2), [2, 0]);
    assert_eq!(segment.al_state(1), 8);
    assert_eq!(master.slave(2).unwrap().state, AlState::Operational);
    assert_eq!(master.exchange(TIMEOUT).await.unwrap(), 9);

    // still addressed, only configured again
    assert_eq!(master.recover(2, Duration::from_secs(1)).await.unwrap(), AlState::Operational);
    assert_eq!(master.reconfigure(3, Duration::from_secs(1)).await.unwrap(), AlState::Operational);
    assert_eq!(master.exchange(TIMEOUT).await.unwrap(), 9);
}

#[tokio::test]
async fn recovery_of_another_slave() {
    init();
    let segment = Segment::uniform(2, SlaveConfig::new(0, 0));
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    master.configure().await.unwrap();
    master.request_state_all(AlState::PreOperational, TIMEOUT).await.unwrap();

    segment.replace(1, SlaveConfig::new(1, 1));
    assert!(matches!(
        master.recover(2, Duration::from_secs(1)).await,
        Err(EthercatError::Master(_)),
        ));
    // the newcomer is left unaddressed and untouched
    assert_eq!(segment.memory(1, 0x10, 2), [0, 0]);
    assert_eq!(segment.al_state(1), 1);
    assert_eq!(segment.al_state(0), 2);
}

#[tokio::test]
async fn recovery_with_unreadable_eeprom() {
    init();
    let segment = Segment::uniform(2, SlaveConfig::new(0, 0));
    let mut master = Master::open(segment.clone(), MasterConfig::default());
    master.configure().await.unwrap();

    segment.replace(1, SlaveConfig::new(0, 0).broken_eeprom());
    assert!(master.recover(2, Duration::from_secs(1)).await.is_err());
    // the temporary address is not left behind
    assert_eq!(segment.memory(1, 0x10, 2), [0, 0]);
    assert_eq!(segment.memory(0, 0x10, 2), [1, 0]);
}
