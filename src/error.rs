//! definition of the general ethercat error type

use std::sync::Arc;
use core::fmt;
use crate::rawmaster::SlaveAddress;

/**
    general object reporting an unexpected result regarding ethercat communication

    Its variant are meant to help finding the cause responsible for the problem and how to deal with it.

    [Self::Slave] variant should not be used without an appropriate type for `T`, `T` depend on the operation the slave reports for, and is usually an error code, or an enum.
*/
#[derive(Clone, Debug)]
pub enum EthercatError<T=()> {
    /// error caused by communication support
    ///
    /// these errors are exterior to this library
    Io(Arc<std::io::Error>),

    /// error reported by a slave, its type depend on the operation returning this error
    ///
    /// these errors can generally be handled and fixed by retrying the operation or reconfiguring the slave
    Slave(SlaveAddress, T),

    /// error reported by the master
    ///
    /// these errors can generally be handled and fixed by retrying the operation or using the master differently when the issue is in the user code
    Master(&'static str),

    /// error detected by the master in the ethercat communication
    ///
    /// these errors can generally not be fixed and the whole communication has to be restarted
    Protocol(&'static str),

    /// error is due to too much time elapsed, but does not compromise the communication
    ///
    /// these errors are generally contextual and the operation can be retried.
    Timeout(&'static str),

    /// no slave answered during bus configuration, configuration can be retried once slaves are plugged
    NoSlaves,

    /// the process image needed by the mapping does not fit the master memory
    Capacity {required: usize, available: usize},
}

/// convenient alias to simplify return annotations
pub type EthercatResult<T=(), E=()> = core::result::Result<T, EthercatError<E>>;

impl<T: fmt::Debug> fmt::Display for EthercatError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "io: {}", error),
            Self::Slave(address, value) => write!(f, "slave {:?}: {:?}", address, value),
            Self::Master(message) => write!(f, "master: {}", message),
            Self::Protocol(message) => write!(f, "protocol: {}", message),
            Self::Timeout(message) => write!(f, "timeout: {}", message),
            Self::NoSlaves => write!(f, "no slave found on the segment"),
            Self::Capacity {required, available} => write!(f,
                "process image needs {} bytes but only {} are available",
                required, available),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EthercatError<T> {}

impl<T> From<std::io::Error> for EthercatError<T> {
    fn from(src: std::io::Error) -> Self {
        EthercatError::Io(Arc::new(src))
    }
}

impl<T> From<crate::data::PackingError> for EthercatError<T> {
    fn from(src: crate::data::PackingError) -> Self {
        EthercatError::Protocol(match src {
            crate::data::PackingError::BadSize(_, text) => text,
            crate::data::PackingError::InvalidValue(text) => text,
        })
    }
}

// because rust doesn't allow specialization and already implements `From<T> for T`, we cannot write smart conversions for generic EthercatError<T>, so these are manual conversion methods
impl<E> EthercatError<E> {
    /// convert the error if the slave specific error type allows it
    pub fn into<F>(self) -> EthercatError<F>
    where F: From<E> {
        self.map(|e| F::from(e))
    }
    /// convert the error with a callback handling the case of slave-specific error
    pub fn map<F,T>(self, callback: F) -> EthercatError<T>
    where F: Fn(E) -> T
    {
        match self {
            EthercatError::Slave(address, value) => EthercatError::Slave(address, callback(value)),
            EthercatError::Io(e) => EthercatError::Io(e),
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
            EthercatError::NoSlaves => EthercatError::NoSlaves,
            EthercatError::Capacity {required, available} => EthercatError::Capacity {required, available},
        }
    }
    /// true if the error only means an answer did not come in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
impl EthercatError<()> {
    /// convert an error with no slave-specific type into an error with any slave-specific type
    pub fn upgrade<F>(self) -> EthercatError<F> {
        match self {
            EthercatError::Slave(address, ()) => EthercatError::Protocol(
                match address {
                    SlaveAddress::Logical(_) => "logical memory error",
                    _ => "slave reported an error without detail",
                }),
            EthercatError::Io(e) => EthercatError::Io(e),
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
            EthercatError::NoSlaves => EthercatError::NoSlaves,
            EthercatError::Capacity {required, available} => EthercatError::Capacity {required, available},
        }
    }
}

/// errors with no slave-specific type fit into the errors of every protocol
macro_rules! upgrade_to {
    ($($t: ty),*) => {$(
        impl From<EthercatError<()>> for EthercatError<$t> {
            fn from(src: EthercatError<()>) -> Self {src.upgrade()}
        }
    )*};
}
upgrade_to!(
    crate::registers::AlError,
    crate::mailbox::MailboxError,
    crate::can::CanError,
    crate::servo::ServoError
    );

impl From<EthercatError<crate::mailbox::MailboxError>> for EthercatError<crate::can::CanError> {
    fn from(src: EthercatError<crate::mailbox::MailboxError>) -> Self {src.into()}
}
impl From<EthercatError<crate::mailbox::MailboxError>> for EthercatError<crate::servo::ServoError> {
    fn from(src: EthercatError<crate::mailbox::MailboxError>) -> Self {src.into()}
}
