//! HMAC-MD5-I2P, the SSU packet MAC.
//!
//! Not standard HMAC: the 32-byte key is XOR-folded into 64-byte ipad/opad
//! blocks, and the inner digest is zero-extended to 32 bytes before the
//! outer hash. Interoperability requires reproducing this exactly.

use md5::{Digest, Md5};

/// Compute the 16-byte SSU MAC over `data` with a 32-byte MAC key.
pub fn hmac_md5_i2p(key: &[u8; 32], data: &[u8]) -> [u8; 16] {
    let mut ipad = [0x36u8; 64];
    let mut opad = [0x5Cu8; 64];
    for i in 0..32 {
        ipad[i] ^= key[i];
        opad[i] ^= key[i];
    }

    let mut inner = Md5::new();
    inner.update(ipad);
    inner.update(data);
    let inner_digest = inner.finalize();

    // inner digest zero-extended to 32 bytes
    let mut extended = [0u8; 32];
    extended[..16].copy_from_slice(&inner_digest);

    let mut outer = Md5::new();
    outer.update(opad);
    outer.update(extended);
    outer.finalize().into()
}
