/*!
Convenient structures to read/write the slave's dictionnary objects (SDO) with a known type.

```ignore
// the SDOs are declared first somewhere
let vendor = Sdo::<u32>::sub(0x1018, 1, 0);

// typical use latter in the program
let value = master.sdo_get(slave, &vendor, timeout).await?;
```
*/

use crate::data::{Field, PduData, Storage};
use core::fmt;


/// description of an SDO's subitem, not a SDO itself
#[derive(Clone)]
pub struct Sdo<T: PduData> {
	/// index of the item in the slave's dictionnary of objects
	pub index: u16,
	/// subindex in the item
	pub sub: SdoPart,
	/// field pointing to the subitem in the byte sequence of the transfered data
	pub field: Field<T>,
}
/// specifies which part of an SDO is addressed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SdoPart {
    /// the whole SDO with subitem 0 included, transfered with complete access
    Complete,
    /// one subitem value in the SDO
    Sub(u8),
}
impl<T: PduData> Sdo<T> {
	/// address an sdo subitem, deducing its size from the `PduData` impl
	/// offset is the byte offset of the value in the subitem
	pub fn sub(index: u16, sub: u8, offset: usize) -> Self { Self{
		index,
		sub: SdoPart::Sub(sub),
		field: Field::simple(offset),
	}}
	pub fn sub_with_size(index: u16, sub: u8, offset: usize, size: usize) -> Self { Self{
		index,
		sub: SdoPart::Sub(sub),
		field: Field::new(offset, size),
	}}
	/// address a complete sdo at the given index, the value starting at the first byte
	pub fn complete(index: u16) -> Self { Self{
		index,
		sub: SdoPart::Complete,
		field: Field::simple(0),
	}}
	pub fn complete_with_size(index: u16, size: usize) -> Self { Self{
		index,
		sub: SdoPart::Complete,
		field: Field::new(0, size),
	}}

	/// byte size of the data to transfer to reach the value
	pub fn transfer_size(&self) -> usize {self.field.byte + self.field.len}
	/// packed size of the value itself
	pub fn value_size() -> usize {T::Packed::LEN}
}
impl SdoPart {
    /// return the subindex or 0 for a complete item
    pub fn unwrap(self) -> u8 { match self {
            Self::Complete => 0,
            Self::Sub(i) => i,
    }}
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}
impl<T: PduData> fmt::Debug for Sdo<T> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Sdo {{index: {:x}, sub: {:?}, field: {:?}}}", self.index, self.sub, self.field)
	}
}

/// standard objects every CoE slave exposes, ETG.1000.6 5.6.7.4
pub mod identity {
    use super::Sdo;

    pub fn device_type() -> Sdo<u32> {Sdo::sub(0x1000, 0, 0)}
    pub fn vendor() -> Sdo<u32> {Sdo::sub(0x1018, 1, 0)}
    pub fn product() -> Sdo<u32> {Sdo::sub(0x1018, 2, 0)}
    pub fn revision() -> Sdo<u32> {Sdo::sub(0x1018, 3, 0)}
    pub fn serial() -> Sdo<u32> {Sdo::sub(0x1018, 4, 0)}
}
