/// Weak rolling checksum over one block of data.
///
/// This is the zsync variant, not Adler-32: both halves are plain u16
/// accumulators with wraparound, and the second half weights each byte by its
/// distance from the end of the window.
///
/// a = c[0] + c[1] + ... + c[len-1]
/// b = len*c[0] + (len-1)*c[1] + ... + 1*c[len-1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rsum {
    pub a: u16,
    pub b: u16,
}

impl Rsum {
    /// Compute the checksum of a full block from scratch.
    pub fn of_block(data: &[u8]) -> Self {
        let mut a = 0u16;
        let mut b = 0u16;
        let mut len = data.len() as u16;

        for &c in data {
            a = a.wrapping_add(c as u16);
            b = b.wrapping_add(len.wrapping_mul(c as u16));
            len = len.wrapping_sub(1);
        }
        Rsum { a, b }
    }

    /// Slide the window forward one byte: drop `old`, take in `new`.
    ///
    /// New a = a + new - old
    /// New b = b + new a - (old << block_shift)
    #[inline]
    pub fn roll(&mut self, old: u8, new: u8, block_shift: u32) {
        self.a = self.a.wrapping_add(new as u16).wrapping_sub(old as u16);
        self.b = self
            .b
            .wrapping_add(self.a)
            .wrapping_sub(((old as u32) << block_shift) as u16);
    }
}
