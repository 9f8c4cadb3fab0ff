//! Anti-forensic information splitter.
//!
//! A key is expanded into `stripes` blocks so that destroying any part of
//! the stored material destroys the key. All but the last stripe are random;
//! the last one is the key XORed with the hash-diffused XOR of the others.

use crate::crypto::{random_bytes, HashAlg};
use crate::error::{Error, Result};
use zeroize::Zeroizing;

/// Bytes of split material for a key of `key_len` bytes.
pub fn af_split_size(key_len: usize, stripes: u32) -> usize {
    key_len * stripes as usize
}

fn xor_into(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.iter_mut().zip(other.iter()) {
        *a ^= b;
    }
}

/// Hash each digest-sized block together with its big-endian index.
fn diffuse(block: &mut [u8], hash: HashAlg) {
    let ds = hash.output_len();
    for (i, chunk) in block.chunks_mut(ds).enumerate() {
        let digest = hash.hash(&[&(i as u32).to_be_bytes(), chunk]);
        let len = chunk.len();
        chunk.copy_from_slice(&digest[..len]);
    }
}

/// Split `key` into `stripes` stripes.
pub fn af_split(key: &[u8], stripes: u32, hash: HashAlg) -> Result<Zeroizing<Vec<u8>>> {
    if stripes == 0 {
        return Err(Error::InvalidArgument("AF stripes must be positive".into()));
    }
    let block_len = key.len();
    let mut out = Zeroizing::new(vec![0u8; af_split_size(block_len, stripes)]);
    let mut acc = Zeroizing::new(vec![0u8; block_len]);

    for stripe in out.chunks_mut(block_len).take(stripes as usize - 1) {
        stripe.copy_from_slice(&random_bytes(block_len));
        xor_into(&mut acc, stripe);
        diffuse(&mut acc, hash);
    }

    let last = (stripes as usize - 1) * block_len;
    out[last..].copy_from_slice(key);
    xor_into(&mut out[last..], &acc);
    Ok(out)
}

/// Recover a `key_len`-byte key from split material.
pub fn af_merge(
    material: &[u8],
    key_len: usize,
    stripes: u32,
    hash: HashAlg,
) -> Result<Zeroizing<Vec<u8>>> {
    if stripes == 0 || material.len() < af_split_size(key_len, stripes) {
        return Err(Error::InvalidArgument(format!(
            "AF material of {} bytes too short for {} stripes of {} bytes",
            material.len(),
            stripes,
            key_len
        )));
    }
    let mut acc = Zeroizing::new(vec![0u8; key_len]);

    for stripe in material.chunks(key_len).take(stripes as usize - 1) {
        xor_into(&mut acc, stripe);
        diffuse(&mut acc, hash);
    }

    let last = (stripes as usize - 1) * key_len;
    xor_into(&mut acc, &material[last..last + key_len]);
    Ok(acc)
}
