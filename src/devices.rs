use std::fmt;
use std::path::PathBuf;

use itertools::Itertools;

use crate::core::GenericResult;

pub const DATA_BITS: u32 = 24;

const GUARD_BIT: u32 = 1 << DATA_BITS;
const DATA_MASK: u32 = GUARD_BIT - 1;

/// Contiguous range of `DATA_BITS` device letters starting at `first`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LetterRange {
    first: u8,
}

impl LetterRange {
    pub fn new(first: char) -> GenericResult<LetterRange> {
        let first = first.to_ascii_uppercase();
        if !first.is_ascii_uppercase() || (first as u32) + DATA_BITS - 1 > 'Z' as u32 {
            return Err!("Invalid first device letter: {:?}", first);
        }
        Ok(LetterRange {first: first as u8})
    }

    pub fn first(&self) -> char {
        self.first as char
    }

    pub fn letters(&self) -> impl Iterator<Item = char> + use<> {
        let first = self.first;
        (0..DATA_BITS as u8).map(move |index| (first + index) as char)
    }

    fn index(&self, letter: char) -> Option<u32> {
        let letter = letter.to_ascii_uppercase();
        if !letter.is_ascii_uppercase() || (letter as u8) < self.first {
            return None;
        }

        let index = (letter as u8 - self.first) as u32;
        (index < DATA_BITS).then_some(index)
    }

    fn letter(&self, index: u32) -> char {
        (self.first + index as u8) as char
    }
}

impl Default for LetterRange {
    fn default() -> LetterRange {
        LetterRange {first: b'C'}
    }
}

/// One bit per device letter, most significant bit first starting at the lowest letter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceBitField {
    range: LetterRange,
    bits: u32,
}

impl DeviceBitField {
    pub fn empty(range: LetterRange) -> DeviceBitField {
        DeviceBitField {range, bits: 0}
    }

    pub fn from_letters(range: LetterRange, letters: &str) -> GenericResult<DeviceBitField> {
        let mut field = DeviceBitField::empty(range);

        for letter in letters.chars().filter(|c| !c.is_whitespace() && *c != ',') {
            if !field.set(letter) {
                return Err!(
                    "Invalid device letter {:?}: it must be in {}-{} range",
                    letter, range.first(), range.letter(DATA_BITS - 1));
            }
        }

        Ok(field)
    }

    /// Decodes a guarded bit string. The guard may sit at any position up to `DATA_BITS`: a
    /// shorter field means that all letters after its end are absent.
    pub fn decode(range: LetterRange, raw: u32) -> GenericResult<DeviceBitField> {
        if raw == 0 {
            return Err!("Invalid device bit field: missing guard bit");
        }

        let width = u32::BITS - 1 - raw.leading_zeros();
        if width > DATA_BITS {
            return Err!("Invalid device bit field: {:b} is wider than {} bits", raw, DATA_BITS);
        }

        let data = raw & ((1 << width) - 1);
        Ok(DeviceBitField {range, bits: data << (DATA_BITS - width)})
    }

    pub fn encode(&self) -> u32 {
        GUARD_BIT | self.bits
    }

    pub fn range(&self) -> LetterRange {
        self.range
    }

    pub fn set(&mut self, letter: char) -> bool {
        match self.range.index(letter) {
            Some(index) => {
                self.bits |= bit(index);
                true
            },
            None => false,
        }
    }

    pub fn contains(&self, letter: char) -> bool {
        self.range.index(letter).is_some_and(|index| self.bits & bit(index) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.bits & DATA_MASK == 0
    }

    pub fn letters(&self) -> Vec<char> {
        self.range.letters().filter(|&letter| self.contains(letter)).collect()
    }

    /// Letters which are selected but not currently present.
    pub fn diff(selected: &DeviceBitField, current: &DeviceBitField) -> Vec<char> {
        selected.letters().into_iter().filter(|&letter| !current.contains(letter)).collect()
    }
}

impl fmt::Display for DeviceBitField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:b}", self.encode())
    }
}

fn bit(index: u32) -> u32 {
    1 << (DATA_BITS - 1 - index)
}

#[derive(Clone, Debug)]
pub struct Device {
    pub letter: char,
    pub path: PathBuf,
}

impl Device {
    pub fn has_marker(&self, marker_name: &str) -> bool {
        self.path.is_dir() && self.path.join(marker_name).is_file()
    }
}

pub fn encode<F>(range: LetterRange, devices: &[Device], has_marker: F) -> DeviceBitField
    where F: Fn(&Device) -> bool
{
    let mut field = DeviceBitField::empty(range);

    for device in devices.iter().sorted_by_key(|device| device.letter) {
        if has_marker(device) {
            field.set(device.letter);
        }
    }

    field
}

pub fn scan(range: LetterRange, devices: &[Device], marker_name: &str) -> DeviceBitField {
    encode(range, devices, |device| device.has_marker(marker_name))
}

pub fn format_letters(letters: &[char]) -> String {
    letters.iter().map(|letter| format!("{}:", letter)).join(", ")
}
