//! Traits and impls used to read/write data to/from the wire.

use core::{
	marker::PhantomData,
	fmt,
	};

/**
	trait for data types than can be packed/unpacked to/from a PDU

	every value transiting on the ethercat bus is little endian, implementors shall take care of it
*/
pub trait PduData: Sized {
    const ID: TypeId;
    type Packed: Storage;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;

    fn packed_size() -> usize  {Self::Packed::LEN}
    fn packed_bitsize() -> usize {Self::Packed::LEN*8}
}

/// error raised when a value cannot be converted from or to its wire representation
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PackingError {
    /// the byte slice given has not the expected size, the size found is given
    BadSize(usize, &'static str),
    /// the bytes given do not form a valid value
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;

impl fmt::Display for PackingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSize(size, text) => write!(f, "bad size {}: {}", size, text),
            Self::InvalidValue(text) => write!(f, "invalid value: {}", text),
        }
    }
}


/// this trait is an equivalent to `packed_struct::ByteArray` but since rust doesn't actually support using generic consts in const expressions, we do not have choice
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    const LEN: usize;
    /// buffer of the right size filled with zeros
    fn zeroed() -> Self;
}
impl<const N: usize> Storage for [u8; N] {
    const LEN: usize = N;
    fn zeroed() -> Self {[0; N]}
}

/**
	dtype identifiers associated to dtypes allowing to dynamically check the type of a [PduData] implementor

	It is only convering the common useful types and not all the possible implementors of [PduData]
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TypeId {
	/// default value of the enum, used in case the matching [PduData] does not fit in any of these integers
	CUSTOM,
	VOID, BOOL,
	I8, I16, I32, I64,
	U8, U16, U32, U64,
	F32, F64,
}

impl<const N: usize> PduData for [u8; N] {
	const ID: TypeId = TypeId::CUSTOM;
	type Packed = Self;

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < N
            {return Err(PackingError::BadSize(dst.len(), "not enough bytes for desired slice"))}
        dst[.. N].copy_from_slice(self);
        Ok(())
    }
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.len() < N
            {return Err(PackingError::BadSize(src.len(), "not enough bytes for desired slice"))}
        let mut dst = [0; N];
        dst.copy_from_slice(&src[.. N]);
		Ok(dst)
	}
}

impl PduData for () {
	const ID: TypeId = TypeId::VOID;
	type Packed = [u8; 0];

	fn pack(&self, _dst: &mut [u8]) -> PackingResult<()>  {Ok(())}
	fn unpack(_src: &[u8]) -> PackingResult<Self>  {Ok(())}
}

impl PduData for bool {
	const ID: TypeId = TypeId::BOOL;
	type Packed = [u8; 1];

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()>  {
        if dst.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(dst.len(), "bool needs one byte"))}
        dst[0] = if *self {0b1} else {0b0};
        Ok(())
	}
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(src.len(), "bool needs one byte"))}
		Ok(src[0] & 0b1 == 0b1)
	}
}

/**
    macro implementing [PduData] for a given struct generated with `bilge`

    the bilge struct must have a byte-exact bitsize (`u8`, `u16`, `u32`, `u64` or `u128`) given as second argument. Structs deriving `TryFromBits` report undefined bit patterns as [PackingError::InvalidValue]
*/
macro_rules! bilge_pdudata {
    ($t: ty, $id: ident) => { impl crate::data::PduData for $t {
        const ID: crate::data::TypeId = crate::data::TypeId::CUSTOM;
        type Packed = [u8; core::mem::size_of::<$id>()];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            use crate::data::Storage;
            if dst.len() < Self::Packed::LEN
                {return Err(crate::data::PackingError::BadSize(dst.len(), "bilge struct needs exact size"))}
            dst[.. Self::Packed::LEN].copy_from_slice(&$id::from(*self).to_le_bytes());
            Ok(())
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            use crate::data::Storage;
            if src.len() < Self::Packed::LEN
                {return Err(crate::data::PackingError::BadSize(src.len(), "bilge struct needs exact size"))}
            let mut raw = [0; core::mem::size_of::<$id>()];
            raw.copy_from_slice(&src[.. Self::Packed::LEN]);
            <Self as core::convert::TryFrom<$id>>::try_from($id::from_le_bytes(raw))
                .map_err(|_| crate::data::PackingError::InvalidValue("undefined bit pattern"))
        }
    }};
}
pub(crate) use bilge_pdudata;

/**
    macro declaring an enum of error codes reported by slaves, with their descriptions

    codes not listed are kept in an `Other` variant, so any code received can be converted
*/
macro_rules! status_codes {
    (
        $(#[$meta: meta])*
        pub enum $name: ident: $int: ty {
            $( $(#[$vmeta: meta])* $variant: ident = $code: literal => $text: literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )*
            /// code not known by this master
            Other($int),
        }
        impl From<$int> for $name {
            fn from(code: $int) -> Self {
                match code {
                    $( $code => Self::$variant, )*
                    other => Self::Other(other),
                }
            }
        }
        impl From<$name> for $int {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $code, )*
                    $name::Other(code) => code,
                }
            }
        }
        impl $name {
            /// human readable meaning of the code
            pub fn description(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text, )*
                    Self::Other(_) => "unknown code",
                }
            }
        }
        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{:#x} {}", <$int>::from(*self), self.description())
            }
        }
    };
}
pub(crate) use status_codes;

/// macro implementing [PduData] for numeric types
macro_rules! num_pdudata {
	($t: ty, $id: ident) => { impl crate::data::PduData for $t {
			const ID: crate::data::TypeId = crate::data::TypeId::$id;
            type Packed = [u8; core::mem::size_of::<$t>()];

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
                let size = core::mem::size_of::<$t>();
                if dst.len() < size
                    {return Err(crate::data::PackingError::BadSize(dst.len(), "not enough bytes for integer"))}
				dst[.. size].copy_from_slice(&self.to_le_bytes());
				Ok(())
			}
			fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
                let size = core::mem::size_of::<$t>();
                if src.len() < size
                    {return Err(crate::data::PackingError::BadSize(src.len(), "not enough bytes for integer"))}
                let mut raw = [0; core::mem::size_of::<$t>()];
                raw.copy_from_slice(&src[.. size]);
				Ok(Self::from_le_bytes(raw))
			}
		}};
}

num_pdudata!(u8, U8);
num_pdudata!(u16, U16);
num_pdudata!(u32, U32);
num_pdudata!(u64, U64);
num_pdudata!(i8, I8);
num_pdudata!(i16, I16);
num_pdudata!(i32, I32);
num_pdudata!(i64, I64);
num_pdudata!(f32, F32);
num_pdudata!(f64, F64);



/**
	locate some data in a datagram by its byte position and length, which must be extracted to type `T` to be processed in rust

	It acts like a getter/setter of a value in a byte sequence. One can think of it as an offset to a data location because it does not actually point the data but only its offset in the byte sequence, it also contains its length to dynamically check memory bounds.
*/
#[derive(Default, Eq, Hash)]
pub struct Field<T: PduData> {
    /// this is only here to mark that T is actually used
	extracted: PhantomData<T>,
	/// start byte index of the object
	pub byte: usize,
	/// byte length of the object
	pub len: usize,
}
impl<T: PduData> Field<T>
{
	/// build a Field from its byte offset and byte length
	pub const fn new(byte: usize, len: usize) -> Self {
		Self{extracted: PhantomData, byte, len}
	}
	/// build a Field from its byte offset, infering its length from the data nominal size
	pub const fn simple(byte: usize) -> Self {
        Self{extracted: PhantomData, byte, len: T::Packed::LEN}
	}
	/// byte range covered by this field
	pub fn range(&self) -> core::ops::Range<usize> {
		self.byte .. self.byte + self.len
	}

	/// extract the value pointed by the field in the given byte array
	pub fn get(&self, data: &[u8]) -> PackingResult<T>       {
		let src = data.get(self.range())
			.ok_or(PackingError::BadSize(data.len(), "field out of buffer"))?;
		T::unpack(src)
	}
	/// dump the given value to the place pointed by the field in the byte array
	pub fn set(&self, data: &mut [u8], value: T) -> PackingResult<()>  {
		let size = data.len();
		let dst = data.get_mut(self.range())
			.ok_or(PackingError::BadSize(size, "field out of buffer"))?;
        value.pack(dst)
	}
}
impl<T: PduData> fmt::Debug for Field<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Field{{0x{:x}, {}}}", self.byte, self.len)
	}
}
// [Clone] and [Copy] must be implemented manually to allow copying a field pointing to a type which does not implement this operation
impl<T: PduData> Clone for Field<T> {
    fn clone(&self) -> Self   {Self::new(self.byte, self.len)}
}
impl<T: PduData> Copy for Field<T> {}
impl<T: PduData> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool {
        self.byte == other.byte && self.len == other.len
    }
}



/**
    helper to read/write sequencial data from/to a byte slice

    It is close to what [std::io::Cursor] is doing, but this struct allows reading forward without consuming the stream, and returns slices without copying the data. It is also meant to work with [PduData]

    Depending on the mutability of the slice this struct is built on, different capabilities are provided.
*/
pub struct Cursor<T> {
    position: usize,
    data: T,
}
impl<T> Cursor<T> {
    /// create a new cursor starting at position zero in the given slice
    pub fn new(data: T) -> Self   {Self{position: 0, data}}
    /**
        current position in the read/write slice

        bytes before this position are considered read or written, and bytes after are coming for use in next read/write calls
    */
    pub fn position(&self) -> usize   {self.position}
}
impl<T: AsRef<[u8]>> Cursor<T> {
    fn advance(&mut self, size: usize) -> PackingResult<core::ops::Range<usize>> {
        let start = self.position;
        let end = start + size;
        if end > self.data.as_ref().len()
            {return Err(PackingError::BadSize(self.data.as_ref().len(), "cursor reached end of data"))}
        self.position = end;
        Ok(start .. end)
    }
    /// read the next coming bytes with a [PduData] value, and increment the position
    pub fn unpack<P: PduData>(&mut self) -> PackingResult<P> {
        let range = self.advance(P::Packed::LEN)?;
        P::unpack(&self.data.as_ref()[range])
    }
    /// read the next coming `size` bytes and increment the position
    pub fn read(&mut self, size: usize) -> PackingResult<&'_ [u8]> {
        let range = self.advance(size)?;
        Ok(&self.data.as_ref()[range])
    }
    /// return all the remaining bytes after current position, but does not advance the cursor
    pub fn remain(&self) -> &'_ [u8] {
        &self.data.as_ref()[self.position ..]
    }
}
impl<'a> Cursor<&'a [u8]> {
    /// consume self and return a slice until current position
    pub fn finish(self) -> &'a [u8] {
        let Self {position, data} = self;
        &data[.. position]
    }
}
impl<'a> Cursor<&'a mut [u8]> {
    /// write the next coming bytes with a [PduData] value, and increment the position
    pub fn pack<P: PduData>(&mut self, value: &P) -> PackingResult<()> {
        let range = self.advance(P::Packed::LEN)?;
        value.pack(&mut self.data[range])
    }
    /// write the next coming bytes with the given slice, and increment the position
    pub fn write(&mut self, value: &[u8]) -> PackingResult<()> {
        let range = self.advance(value.len())?;
        self.data[range].copy_from_slice(value);
        Ok(())
    }
    /// consume self and return a slice until current position
    pub fn finish(self) -> &'a mut [u8] {
        let Self {position, data} = self;
        &mut data[.. position]
    }
}
