//! Multi-rotor stream cipher
//!
//! A keyed bank of byte permutations stepped like an odometer after every
//! processed byte. Encryption walks the rotors front to back through the
//! forward tables, decryption walks them back to front through the inverse
//! tables, so both sides stay in lockstep as long as they start from the same
//! key and see the same number of bytes.

use tracing::debug;

use crate::error::{Error, Result};

/// Rotor count used when none is given
pub const DEFAULT_ROTORS: usize = 6;

/// Alphabet size of every rotor
pub const ROTOR_SIZE: usize = 256;

/// Starting values of the five key accumulators
const KEY_SEEDS: [u16; 5] = [995, 576, 767, 671, 463];

/// Five 16-bit accumulators folded from the key bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySchedule {
    words: [i16; 5],
}

impl KeySchedule {
    pub fn derive(key: &[u8]) -> Self {
        let [mut k1, mut k2, mut k3, mut k4, mut k5] = KEY_SEEDS;

        for &b in key {
            let ki = u16::from(b);
            k1 = k1.rotate_left(3).wrapping_add(ki);
            k2 = k2.rotate_left(3) ^ ki;
            k3 = k3.rotate_left(3).wrapping_sub(ki);
            k4 = ki.wrapping_sub(k4.rotate_left(3));
            k5 = k5.rotate_left(3) ^ !ki;
        }

        // Second word is always odd
        Self {
            words: [k1 as i16, (k2 | 1) as i16, k3 as i16, k4 as i16, k5 as i16],
        }
    }

    pub fn words(&self) -> [i16; 5] {
        self.words
    }

    /// PRNG seed taken from the first three words
    pub fn seed(&self) -> [i32; 3] {
        [
            i32::from(self.words[0]),
            i32::from(self.words[1]),
            i32::from(self.words[2]),
        ]
    }
}

/// Three-register multiplicative congruential generator
///
/// Every register uses C-style truncating division, so negative seeds coming
/// straight from the key schedule behave exactly like the deployed cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prng {
    x: i32,
    y: i32,
    z: i32,
}

impl Prng {
    pub fn new(seed: [i32; 3]) -> Self {
        let [x, y, z] = seed;
        Self { x, y, z }
    }

    /// Next draw in `[0, 1)`
    pub fn next_f64(&mut self) -> f64 {
        let mut x = 171 * (self.x % 177) - 2 * (self.x / 177);
        let mut y = 172 * (self.y % 176) - 35 * (self.y / 176);
        let mut z = 170 * (self.z % 178) - 63 * (self.z / 178);

        if x < 0 {
            x += 30269;
        }
        if y < 0 {
            y += 30307;
        }
        if z < 0 {
            z += 30323;
        }

        self.x = x;
        self.y = y;
        self.z = z;

        let term = f64::from(x) / 30269.0 + f64::from(y) / 30307.0 + f64::from(z) / 30323.0;
        let val = term - term.floor();
        if val >= 1.0 { 0.0 } else { val }
    }

    /// Next draw in `[0, bound)`, zero for an empty range
    pub fn below(&mut self, bound: usize) -> usize {
        if bound == 0 {
            return 0;
        }
        let s = bound as f64;
        ((self.next_f64() * s) % s) as usize
    }
}

/// Keyed rotor bank
///
/// Tables and odometer state are built lazily on first use and rebuilt on
/// every [`encrypt`](Self::encrypt) / [`decrypt`](Self::decrypt) call.
#[derive(Debug, Clone)]
pub struct RotorCipher {
    key: KeySchedule,
    prng: Prng,
    forward: Vec<[u8; ROTOR_SIZE]>,
    inverse: Vec<[u8; ROTOR_SIZE]>,
    positions: Vec<u8>,
    advances: Vec<u8>,
    initialized: bool,
}

impl RotorCipher {
    /// Cipher with [`DEFAULT_ROTORS`] rotors
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self::build(key.as_ref(), DEFAULT_ROTORS)
    }

    pub fn with_rotors(key: impl AsRef<[u8]>, rotors: usize) -> Result<Self> {
        if rotors == 0 {
            return Err(Error::InvalidRotorCount);
        }
        Ok(Self::build(key.as_ref(), rotors))
    }

    fn build(key: &[u8], rotors: usize) -> Self {
        let key = KeySchedule::derive(key);
        Self {
            key,
            prng: Prng::new(key.seed()),
            forward: vec![[0; ROTOR_SIZE]; rotors],
            inverse: vec![[0; ROTOR_SIZE]; rotors],
            positions: vec![0; rotors],
            advances: vec![0; rotors],
            initialized: false,
        }
    }

    /// Replace the key; the next call rebuilds every rotor
    pub fn set_key(&mut self, key: impl AsRef<[u8]>) {
        self.key = KeySchedule::derive(key.as_ref());
        self.initialized = false;
    }

    pub fn key_schedule(&self) -> &KeySchedule {
        &self.key
    }

    pub fn rotor_count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[u8] {
        &self.positions
    }

    pub fn advances(&self) -> &[u8] {
        &self.advances
    }

    /// Encrypt `data` from a freshly initialized state
    pub fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        self.process(data, true, true)
    }

    /// Decrypt `data` from a freshly initialized state
    pub fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        self.process(data, false, true)
    }

    /// Encrypt `data` continuing from the current rotor state
    pub fn encrypt_continue(&mut self, data: &[u8]) -> Vec<u8> {
        self.process(data, true, false)
    }

    /// Decrypt `data` continuing from the current rotor state
    pub fn decrypt_continue(&mut self, data: &[u8]) -> Vec<u8> {
        self.process(data, false, false)
    }

    fn process(&mut self, data: &[u8], encrypting: bool, reinit: bool) -> Vec<u8> {
        if reinit || !self.initialized {
            self.init();
        }

        if encrypting {
            data.iter().map(|&b| self.encrypt_byte(b)).collect()
        } else {
            data.iter().map(|&b| self.decrypt_byte(b)).collect()
        }
    }

    fn init(&mut self) {
        self.prng = Prng::new(self.key.seed());

        for i in 0..self.rotor_count() {
            self.positions[i] = self.prng.below(ROTOR_SIZE) as u8;
            self.advances[i] = (1 + 2 * self.prng.below(ROTOR_SIZE / 2)) as u8;
            self.permute_rotor(i);
        }

        self.initialized = true;
        debug!(rotors = self.rotor_count(), "rotor bank initialized");
    }

    /// Shuffle rotor `idx` from the identity and rebuild its inverse
    fn permute_rotor(&mut self, idx: usize) {
        let forward = &mut self.forward[idx];
        for (j, slot) in forward.iter_mut().enumerate() {
            *slot = j as u8;
        }

        let mut i = ROTOR_SIZE;
        while i >= 2 {
            let q = self.prng.below(i);
            i -= 1;
            forward.swap(q, i);
        }

        let inverse = &mut self.inverse[idx];
        for (pos, &value) in forward.iter().enumerate() {
            inverse[usize::from(value)] = pos as u8;
        }
    }

    /// Step the odometer, carrying one unit into the next rotor on wrap
    fn advance(&mut self) {
        let last = self.rotor_count() - 1;
        for i in 0..=last {
            let temp = usize::from(self.positions[i]) + usize::from(self.advances[i]);
            self.positions[i] = (temp % ROTOR_SIZE) as u8;
            if temp >= ROTOR_SIZE && i < last {
                self.positions[i + 1] = self.positions[i + 1].wrapping_add(1);
            }
        }
    }

    fn encrypt_byte(&mut self, p: u8) -> u8 {
        let mut tp = p;
        for (table, &pos) in self.forward.iter().zip(&self.positions) {
            tp = table[usize::from(pos ^ tp)];
        }
        self.advance();
        tp
    }

    fn decrypt_byte(&mut self, c: u8) -> u8 {
        let mut tc = c;
        for (table, &pos) in self.inverse.iter().zip(&self.positions).rev() {
            tc = pos ^ table[usize::from(tc)];
        }
        self.advance();
        tc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HELLO_CIPHER: [u8; 11] = [
        0x15, 0xa4, 0x3d, 0xc5, 0x7d, 0x48, 0xad, 0xd5, 0xf4, 0xc5, 0x7c,
    ];

    #[test]
    fn test_key_schedule() {
        let key = KeySchedule::derive(b"test");
        assert_eq!(key.words(), [13707, -3447, -5406, 7294, 688]);
        assert_eq!(key.seed(), [13707, -3447, -5406]);
        assert_eq!(key.words()[1] & 1, 1);
    }

    #[test]
    fn test_empty_key_schedule_keeps_seeds() {
        let key = KeySchedule::derive(b"");
        assert_eq!(key.words(), [995, 577, 767, 671, 463]);
    }

    #[test]
    fn test_prng_stays_in_range() {
        let mut prng = Prng::new(KeySchedule::derive(b"range").seed());
        for _ in 0..1000 {
            let v = prng.next_f64();
            assert!((0.0..1.0).contains(&v));
            assert!(prng.below(7) < 7);
        }
        assert_eq!(prng.below(0), 0);
    }

    #[test]
    fn test_init_state() {
        let mut cipher = RotorCipher::new("test");
        cipher.init();
        assert_eq!(cipher.positions(), &[144, 216, 42, 201, 54, 248]);
        assert_eq!(cipher.advances(), &[103, 247, 237, 23, 119, 211]);
        assert_eq!(&cipher.forward[0][..8], &[8, 159, 252, 20, 13, 193, 86, 88]);
    }

    #[test]
    fn test_tables_are_inverse_and_advances_odd() {
        let mut cipher = RotorCipher::with_rotors("inverse check", 9).unwrap();
        cipher.init();
        for (forward, inverse) in cipher.forward.iter().zip(&cipher.inverse) {
            for v in 0..ROTOR_SIZE {
                assert_eq!(usize::from(inverse[usize::from(forward[v])]), v);
            }
        }
        assert!(cipher.advances().iter().all(|a| a % 2 == 1));
    }

    #[test]
    fn test_known_ciphertext() {
        let mut cipher = RotorCipher::new("test");
        assert_eq!(cipher.encrypt(b"hello world"), HELLO_CIPHER);
        assert_eq!(cipher.positions(), &[253, 121, 100, 208, 84, 14]);
        assert_eq!(cipher.advances(), &[103, 247, 237, 23, 119, 211]);

        assert_eq!(cipher.decrypt(&HELLO_CIPHER), b"hello world");
    }

    #[test]
    fn test_single_rotor_known_ciphertext() {
        let mut cipher = RotorCipher::with_rotors(b"k", 1).unwrap();
        assert_eq!(cipher.encrypt(&[0x00, 0x01, 0x02, 0xff]), [0x6a, 0xcf, 0xe4, 0x15]);
    }

    #[test]
    fn test_continue_matches_single_call() {
        let mut cipher = RotorCipher::new("test");
        let mut out = cipher.encrypt(b"hello ");
        out.extend(cipher.encrypt_continue(b"world"));
        assert_eq!(out, HELLO_CIPHER);

        let mut plain = cipher.decrypt(&HELLO_CIPHER[..4]);
        plain.extend(cipher.decrypt_continue(&HELLO_CIPHER[4..]));
        assert_eq!(plain, b"hello world");
    }

    #[test]
    fn test_continue_initializes_lazily() {
        let mut cipher = RotorCipher::new("test");
        assert_eq!(cipher.encrypt_continue(b"hello world"), HELLO_CIPHER);
    }

    #[test]
    fn test_encrypt_resets_between_calls() {
        let mut cipher = RotorCipher::new("test");
        let first = cipher.encrypt(b"hello world");
        let second = cipher.encrypt(b"hello world");
        assert_eq!(first, second);
    }

    #[test]
    fn test_set_key_rebuilds() {
        let mut cipher = RotorCipher::new("other");
        cipher.encrypt(b"warm up");
        cipher.set_key("test");
        assert_eq!(cipher.encrypt_continue(b"hello world"), HELLO_CIPHER);
    }

    #[test]
    fn test_zero_rotors_rejected() {
        assert!(matches!(
            RotorCipher::with_rotors("test", 0),
            Err(Error::InvalidRotorCount)
        ));
    }

    #[test]
    fn test_empty_input() {
        let mut cipher = RotorCipher::new("test");
        assert!(cipher.encrypt(&[]).is_empty());
        assert!(cipher.decrypt(&[]).is_empty());
    }

    #[test]
    fn test_same_key_same_state() {
        let mut a = RotorCipher::new("lockstep");
        let mut b = RotorCipher::new("lockstep");
        let data = vec![0x5a; 700];

        assert_eq!(a.encrypt(&data[..300]), b.encrypt(&data[..300]));
        assert_eq!(a.encrypt_continue(&data[300..]), b.encrypt_continue(&data[300..]));
        assert_eq!(a.positions(), b.positions());
        assert_eq!(a.advances(), b.advances());
    }

    proptest! {
        #[test]
        fn test_decrypt_inverts_encrypt(
            key in proptest::collection::vec(any::<u8>(), 0..32),
            data in proptest::collection::vec(any::<u8>(), 0..512),
            rotors in 1usize..9,
        ) {
            let mut cipher = RotorCipher::with_rotors(&key, rotors).unwrap();
            let enc = cipher.encrypt(&data);
            prop_assert_eq!(enc.len(), data.len());
            prop_assert_eq!(cipher.decrypt(&enc), data);
        }
    }
}
