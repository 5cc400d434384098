use super::EthercatSocket;
use core::{
    sync::atomic::{AtomicBool, Ordering},
    task::{Poll, Context},
    };
use std::io;
use log::{debug, warn};


/// one of the two network ports of a [RedundantSocket]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Port {
    Primary,
    Secondary,
}

/**
    socket sending frames over two ports connected to both ends of a segment

    frames are sent on the active port only. When sending fails on the active port, the other port becomes active and the frame is sent on it instead. Frames are received from whichever port delivers them, so a frame that traveled the ring in either direction is accepted.
*/
pub struct RedundantSocket<P, S> {
    primary: P,
    secondary: S,
    /// true when the secondary port is the active one
    failed_over: AtomicBool,
}

impl<P: EthercatSocket, S: EthercatSocket> RedundantSocket<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self {primary, secondary, failed_over: AtomicBool::new(false)}
    }
    /// port currently used for sending
    pub fn active(&self) -> Port {
        if self.failed_over.load(Ordering::Relaxed)  {Port::Secondary}
        else  {Port::Primary}
    }
    /// force the active port, for instance to go back to the primary once its link is repaired
    pub fn set_active(&self, port: Port) {
        self.failed_over.store(port == Port::Secondary, Ordering::Relaxed);
    }

    fn send_on(&self, port: Port, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        match port {
            Port::Primary => self.primary.poll_send(cx, data),
            Port::Secondary => self.secondary.poll_send(cx, data),
        }
    }
    fn receive_on(&self, port: Port, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>> {
        match port {
            Port::Primary => self.primary.poll_receive(cx, data),
            Port::Secondary => self.secondary.poll_receive(cx, data),
        }
    }
}

impl<P: EthercatSocket, S: EthercatSocket> EthercatSocket for RedundantSocket<P, S> {
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>> {
        let active = self.active();
        let (first, second) = match active {
            Port::Primary => (Port::Primary, Port::Secondary),
            Port::Secondary => (Port::Secondary, Port::Primary),
        };
        let failure = match self.receive_on(first, cx, data) {
            Poll::Ready(Ok(size)) => return Poll::Ready(Ok(size)),
            Poll::Ready(Err(error)) => Some(error),
            Poll::Pending => None,
        };
        match (self.receive_on(second, cx, data), failure) {
            (Poll::Ready(Ok(size)), _) => Poll::Ready(Ok(size)),
            // the error is only reported once no port can receive anymore
            (Poll::Ready(Err(_)), Some(error)) => Poll::Ready(Err(error)),
            (Poll::Pending, Some(error)) => {
                debug!("redundant socket: receive error on {:?} port: {}", first, error);
                Poll::Pending
            },
            // errors on the standby port are not relevant as long as the active port works
            (Poll::Ready(Err(_)), None) | (Poll::Pending, None) => Poll::Pending,
        }
    }

    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        let active = self.active();
        match self.send_on(active, cx, data) {
            Poll::Ready(Err(error)) => {
                let standby = match active {
                    Port::Primary => Port::Secondary,
                    Port::Secondary => Port::Primary,
                };
                warn!("redundant socket: send failed on {:?} port ({}), failing over to {:?}", active, error, standby);
                self.set_active(standby);
                self.send_on(standby, cx, data)
            },
            other => other,
        }
    }

    fn max_frame(&self) -> usize {
        self.primary.max_frame().min(self.secondary.max_frame())
    }
}
