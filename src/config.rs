//! tunable parameters of a master

use core::time::Duration;
use tokio::time::{Instant, sleep};


/**
    settings of a [crate::Master]

    operations called by the user with an explicit timeout use it, these settings are only the defaults used by the sequences internal to the master (configuration, mapping, recovery) and by shorthand methods.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct MasterConfig {
    /// time waited for a datagram answer before considering no slave answered
    pub timeout: Duration,
    /// time waited for an EEPROM operation
    pub eeprom_timeout: Duration,
    /// time waited for a slave to empty its mailbox before writing a request
    pub mailbox_send_timeout: Duration,
    /// time waited for a slave to answer a mailbox request
    pub mailbox_receive_timeout: Duration,
    /// time waited for a slave to reach a requested state
    pub state_timeout: Duration,
    /// maximum size of the process image (bytes)
    pub image_capacity: usize,
    /// delays between polls when waiting for a slave
    pub backoff: PollBackoff,
    /// delay between the configuration of distributed clock sync signals and their first pulse
    pub sync_delay: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2),
            eeprom_timeout: Duration::from_millis(20),
            mailbox_send_timeout: Duration::from_millis(20),
            mailbox_receive_timeout: Duration::from_millis(700),
            state_timeout: Duration::from_secs(2),
            image_capacity: 4096,
            backoff: PollBackoff {
                min: Duration::from_micros(50),
                max: Duration::from_millis(10),
                },
            sync_delay: Duration::from_millis(100),
        }
    }
}

/// delays between successive polls of a slave register, growing exponentially between the given bounds
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PollBackoff {
    pub min: Duration,
    pub max: Duration,
}
impl PollBackoff {
    /// start a new polling sequence
    pub fn start(&self) -> Duration {self.min}
    /**
        wait before the next poll, doubling `delay` for the next time

        returns false without waiting if the deadline is already reached, the wait never goes beyond the deadline
    */
    pub async fn wait(&self, delay: &mut Duration, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline
            {return false}
        sleep((*delay).min(deadline - now)).await;
        *delay = (*delay * 2).min(self.max).max(self.min);
        true
    }
}
