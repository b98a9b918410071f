use std::fmt;
use std::ops::Add;

/// A serial command as it is shifted out to the chip, one bit per clock.
///
/// Only the buffer shape lives here. Which bits make up a given command is
/// decided by the register model that renders it.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Command {
    bits: Vec<bool>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    /// `n` zero bits; idles the command decoder for `n` clocks.
    pub fn zeros(n: usize) -> Self {
        Self {
            bits: vec![false; n],
        }
    }

    pub fn from_bits<I: IntoIterator<Item = bool>>(bits: I) -> Self {
        Self {
            bits: bits.into_iter().collect(),
        }
    }

    /// Parses a string of `0`/`1` characters, ignoring whitespace and `_`.
    pub fn parse(s: &str) -> Option<Self> {
        s.chars()
            .filter(|c| !c.is_whitespace() && *c != '_')
            .map(|c| match c {
                '0' => Some(false),
                '1' => Some(true),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(|bits| Self { bits })
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    pub fn extend(&mut self, other: &Command) {
        self.bits.extend_from_slice(&other.bits);
    }

    /// Appends zeros up to the next byte boundary.
    pub fn pad_to_byte(&mut self) {
        let rem = self.bits.len() % 8;
        if rem != 0 {
            self.bits.resize(self.bits.len() + 8 - rem, false);
        }
    }

    /// Joins `parts` in order. With `byte_padding` every part is padded to a
    /// whole number of bytes before the next one is appended, so each part
    /// starts on a byte boundary in command memory.
    pub fn concat<'a, I>(parts: I, byte_padding: bool) -> Self
    where
        I: IntoIterator<Item = &'a Command>,
    {
        let mut out = Command::new();
        for part in parts {
            out.extend(part);
            if byte_padding {
                out.pad_to_byte();
            }
        }
        out
    }

    /// Packs the bits MSB first, zero filling the last byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, &b)| acc | ((b as u8) << (7 - i)))
            })
            .collect()
    }
}

impl Add<&Command> for Command {
    type Output = Command;

    fn add(mut self, rhs: &Command) -> Command {
        self.extend(rhs);
        self
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({} bits: ", self.bits.len())?;
        for &b in self.bits.iter().take(64) {
            f.write_str(if b { "1" } else { "0" })?;
        }
        if self.bits.len() > 64 {
            f.write_str("...")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_with_byte_padding_aligns_every_part() {
        let a = Command::parse("101").unwrap();
        let b = Command::parse("11").unwrap();
        let joined = Command::concat([&a, &b], true);
        assert_eq!(joined.len(), 16);
        assert_eq!(joined.to_bytes(), vec![0b1010_0000, 0b1100_0000]);
    }

    #[test]
    fn concat_without_padding_keeps_length() {
        let a = Command::parse("101").unwrap();
        let b = Command::zeros(4);
        assert_eq!(Command::concat([&a, &b], false).len(), 7);
        assert_eq!((a + &b).len(), 7);
    }

    #[test]
    fn parse_rejects_non_binary() {
        assert!(Command::parse("10x1").is_none());
        assert_eq!(Command::parse("1011_0001").unwrap().to_bytes(), vec![0xB1]);
    }
}
