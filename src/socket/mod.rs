/*!
    This module provide the trait [EthercatSocket], the only door between this master and the physical layer.

    The master never touches network interfaces itself: raw ethernet encapsulation (ethertype `0x88a4`), UDP encapsulation, or any simulated segment are implemented outside of this crate by implementing [EthercatSocket].

    [RedundantSocket] combines two sockets connected to both ends of the same segment, so the communication survives a failure of one of them.
*/

mod redundant;

pub use redundant::{RedundantSocket, Port};
use core::task::{Poll, Context};
use std::{io, sync::Arc};

/**
    trait implementing the ethercat frame encapsulation into some medium

    This allows to send or receive ethercat frames over any network, but according to ETG 1000.4, only Ethernet and UDP are officially supported.
    Only one frame is expected in flight at a time, the master waits for its answer (or a timeout) before sending the next one.
*/
pub trait EthercatSocket {
    /**
        receive an ethercat frame into the given buffer (starting from ethercat header)

        The buffer should be big enough for the data to receive. No indication of the data size is provided by the socket. Returns the number of bytes read.

        The implementor is responsible from assembling the whole packet, and hiding the details of socket-specific headers, footers, checks, fragmentation ...
        When no frame is available, the implementor must register the waker of `cx` and return [Poll::Pending]
    */
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>>;

    /**
        send an ethercat frame contained in the given buffer.

        The whole buffer will be sent, the user has to tail it to the exact data size to send.

        the buffer passed must contain the data with the ethercat header.
        The implentor of this trait is responsible of encapsulating the data into the specific socket by adding the necessary specific headers, footers, checks, fragmentation ...
    */
    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>>;

    /// maximum frame size tolerated for sending by this socket
    fn max_frame(&self) -> usize;
}

impl<S: EthercatSocket + ?Sized> EthercatSocket for Box<S> {
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>> {
        (**self).poll_receive(cx, data)
    }
    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        (**self).poll_send(cx, data)
    }
    fn max_frame(&self) -> usize  {(**self).max_frame()}
}

impl<S: EthercatSocket + ?Sized> EthercatSocket for Arc<S> {
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>> {
        (**self).poll_receive(cx, data)
    }
    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        (**self).poll_send(cx, data)
    }
    fn max_frame(&self) -> usize  {(**self).max_frame()}
}
