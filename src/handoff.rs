//! Physical pickup verification via a displayed/scanned code.
//!
//! The driver displays `encode(ride_id)`, the rider scans it and the flow
//! compares the decoded id against the ledger's id for the current ride.
//! The checksum only guards against a garbled scan. This is a plain equality
//! check, not a cryptographic proof: anyone who knows the ride id can
//! produce a valid code.

use crate::error::FlowError;

#[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq, Eq)]
struct HandoffToken {
    #[n(0)]
    ride_id: String,
    #[n(1)]
    checksum: String, // sha256 over the ride id
}

/// Encode a ride id into a hex-armored token suitable for a QR code.
pub fn encode(ride_id: &str) -> Result<String, FlowError> {
    let token = HandoffToken {
        ride_id: ride_id.to_string(),
        checksum: sha256::digest(ride_id),
    };
    Ok(hex::encode(minicbor::to_vec(&token)?))
}

/// Decode a scanned code back into a ride id. Anything that does not parse
/// or fails its checksum is a verification failure, not a decode error.
pub fn decode(scanned: &str) -> Result<String, FlowError> {
    let bytes = hex::decode(scanned).map_err(|_| FlowError::VerificationFailed)?;
    let token: HandoffToken =
        minicbor::decode(&bytes).map_err(|_| FlowError::VerificationFailed)?;

    if sha256::digest(token.ride_id.as_str()) != token.checksum {
        return Err(FlowError::VerificationFailed);
    }
    Ok(token.ride_id)
}

/// Check a scanned code against the ride the caller is actually on.
pub fn verify(expected_ride_id: &str, scanned: &str) -> Result<(), FlowError> {
    let scanned_id = decode(scanned)?;
    if scanned_id != expected_ride_id {
        return Err(FlowError::VerificationFailed);
    }
    Ok(())
}
