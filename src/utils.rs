//! Utility functions for id and memo minting

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique user id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

// ride ids are minted client-side at request time, under a fixed hrp
pub fn new_ride_id() -> String {
    let hrp = bech32::Hrp::parse_unchecked("ride_");
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .expect("failed to serialise ride id to bech32 encoding.")
}

/// Mint a transfer memo. Memos must be unique per attempt so a retried leg
/// can never be mistaken for a double-send.
pub fn new_memo() -> String {
    uuid7().to_string()
}
