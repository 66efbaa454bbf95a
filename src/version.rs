// File: src/version.rs
//
// CPython version identification for bytecode decoding.
// Maps .pyc magic words to interpreter versions and defines the header
// layout rules that changed across releases.

use crate::errors::DecompileError;
use ahash::AHashMap;
use once_cell::sync::Lazy;
use std::fmt;

/// An interpreter release, ordered so the engine can gate behavior with
/// plain comparisons (`ver >= PythonVersion::new(3, 11)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PythonVersion {
    pub major: u8,
    pub minor: u8,
}

impl PythonVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn is_py3(self) -> bool {
        self.major >= 3
    }

    /// 3.6 switched to fixed two-byte "wordcode" instructions.
    pub fn uses_wordcode(self) -> bool {
        self >= Self::new(3, 6)
    }

    /// 3.10 started counting jump offsets in instruction words.
    pub fn word_jumps(self) -> bool {
        self >= Self::new(3, 10)
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Low 16 bits of the .pyc magic word for each supported release.
///
/// The high half is b"\r\n" for everything since 1.3; 1.0-1.2 used ad-hoc
/// words that are matched on the full 32 bits below. Multiple magics per
/// minor version appear where CPython bumped the number mid-cycle.
static MAGIC_WORDS: Lazy<AHashMap<u16, PythonVersion>> = Lazy::new(|| {
    let mut m = AHashMap::new();
    let mut put = |words: &[u16], major, minor| {
        for &w in words {
            m.insert(w, PythonVersion::new(major, minor));
        }
    };
    put(&[0x2E89], 1, 3);
    put(&[0x1704], 1, 4);
    put(&[0x4E99], 1, 5);
    put(&[0xC4FC], 1, 6);
    put(&[0xC687], 2, 0);
    put(&[0xEB2A], 2, 1);
    put(&[0xED2D], 2, 2);
    put(&[62011, 62021], 2, 3);
    put(&[62041, 62051, 62061], 2, 4);
    put(&[62071, 62081, 62091, 62092, 62101, 62111, 62121, 62131], 2, 5);
    put(&[62151, 62161], 2, 6);
    put(&[62171, 62181, 62191, 62201, 62211], 2, 7);
    put(&[3000, 3010, 3020, 3030, 3040, 3050, 3060, 3061, 3071, 3081, 3091, 3101, 3103, 3111, 3131], 3, 0);
    put(&[3141, 3151], 3, 1);
    put(&[3160, 3170, 3180], 3, 2);
    put(&[3190, 3200, 3210, 3220, 3230], 3, 3);
    put(&[3250, 3260, 3270, 3280, 3290, 3300, 3310], 3, 4);
    put(&[3320, 3330, 3340, 3350, 3351], 3, 5);
    put(&[3360, 3361, 3370, 3371, 3372, 3373, 3375, 3376, 3377, 3378, 3379], 3, 6);
    put(&[3390, 3391, 3392, 3393, 3394], 3, 7);
    put(&[3400, 3401, 3410, 3411, 3412, 3413], 3, 8);
    put(&[3420, 3421, 3422, 3423, 3424, 3425], 3, 9);
    put(&[3430, 3431, 3432, 3433, 3434, 3435, 3438, 3439], 3, 10);
    put(&[3450, 3451, 3452, 3453, 3454, 3455, 3457, 3458, 3459, 3460, 3461, 3462, 3463, 3464, 3465, 3466, 3471, 3472, 3473, 3474, 3475, 3476, 3477, 3478, 3480, 3481, 3482, 3483, 3484, 3485, 3486, 3487, 3488, 3489, 3490, 3491, 3492, 3493, 3494, 3495], 3, 11);
    put(&[3500, 3501, 3502, 3503, 3504, 3505, 3506, 3507, 3508, 3509, 3510, 3511, 3512, 3513, 3514, 3515, 3516, 3517, 3518, 3519, 3520, 3521, 3522, 3523, 3524, 3525, 3526, 3527, 3528, 3529, 3530, 3531], 3, 12);
    m
});

/// Resolve a full 32-bit magic word to a version.
///
/// Returns an error naming the word when it is not a known CPython magic.
pub fn version_from_magic(magic: u32) -> Result<PythonVersion, DecompileError> {
    // 1.0-1.2 predate the "\r\n" suffix convention.
    match magic {
        0x00999902 => return Ok(PythonVersion::new(1, 0)),
        0x00999903 => return Ok(PythonVersion::new(1, 1)),
        _ => {}
    }
    if magic >> 16 != 0x0A0D {
        return Err(DecompileError::bad_magic(magic));
    }
    MAGIC_WORDS
        .get(&(magic as u16))
        .copied()
        .ok_or_else(|| DecompileError::bad_magic(magic))
}

/// Number of header bytes between the magic word and the marshal stream.
///
/// - through 3.2: 4-byte mtime
/// - 3.3 - 3.6: mtime + source size
/// - 3.7+: PEP 552 flags word + either mtime/size or source hash
pub fn header_trailer_len(version: PythonVersion) -> usize {
    if version >= PythonVersion::new(3, 7) {
        12
    } else if version >= PythonVersion::new(3, 3) {
        8
    } else {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_magics() {
        assert_eq!(version_from_magic(0x0A0DF303).unwrap(), PythonVersion::new(2, 7));
        assert_eq!(version_from_magic(0x0A0D0D55).unwrap(), PythonVersion::new(3, 8));
        assert_eq!(version_from_magic(0x0A0D0DCB).unwrap(), PythonVersion::new(3, 12));
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert!(version_from_magic(0xDEADBEEF).is_err());
    }

    #[test]
    fn test_version_ordering() {
        assert!(PythonVersion::new(3, 11) > PythonVersion::new(3, 9));
        assert!(PythonVersion::new(2, 7) < PythonVersion::new(3, 0));
        assert!(PythonVersion::new(3, 6).uses_wordcode());
        assert!(!PythonVersion::new(3, 5).uses_wordcode());
    }

    #[test]
    fn test_header_trailer() {
        assert_eq!(header_trailer_len(PythonVersion::new(2, 7)), 4);
        assert_eq!(header_trailer_len(PythonVersion::new(3, 4)), 8);
        assert_eq!(header_trailer_len(PythonVersion::new(3, 11)), 12);
    }
}
