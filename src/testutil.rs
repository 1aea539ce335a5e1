//! Helpers shared by the host test suite.

use std::format;
use std::string::String;

/// Build a checksum-correct S-record line for the given type character.
pub(crate) fn build_line(type_char: char, address: u32, data: &[u8]) -> String {
    let address_bytes = match type_char {
        '0' | '1' | '5' | '9' => 2,
        '2' | '8' => 3,
        '3' | '7' => 4,
        _ => panic!("unknown record type"),
    };
    let count = address_bytes + data.len() + 1;
    let mut sum = count as u8;
    let mut line = format!("S{}{:02X}", type_char, count);
    for i in (0..address_bytes).rev() {
        let b = (address >> (8 * i)) as u8;
        sum = sum.wrapping_add(b);
        line += &format!("{:02X}", b);
    }
    for &b in data {
        sum = sum.wrapping_add(b);
        line += &format!("{:02X}", b);
    }
    line + &format!("{:02X}", !sum)
}
