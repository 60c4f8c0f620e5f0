//! NTLMv2 message construction for WinRM's HTTP `Negotiate` authentication.
//!
//! Only the three-message connection-oriented handshake is implemented:
//! negotiate, challenge (parsed), authenticate. No signing or sealing is
//! negotiated, so message bodies travel as plain SOAP.

use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

/// Flags sent in the negotiate and authenticate messages.
pub const NEGOTIATE_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_128
    | NEGOTIATE_56;

const AUTHENTICATE_HEADER_LEN: usize = 64;

/// Seconds between 1601-01-01 and the Unix epoch.
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;

/// Who we authenticate as.
#[derive(Clone)]
pub struct NtlmIdentity {
    pub user: String,
    pub domain: String,
    password: String,
}

impl NtlmIdentity {
    /// Split `DOMAIN\user` usernames; anything else has an empty domain.
    pub fn new(username: &str, password: &str) -> Self {
        let (domain, user) = match username.split_once('\\') {
            Some((domain, user)) => (domain, user),
            None => ("", username),
        };
        Self {
            user: user.to_string(),
            domain: domain.to_string(),
            password: password.to_string(),
        }
    }
}

impl std::fmt::Debug for NtlmIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtlmIdentity")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Server challenge (message type 2).
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

/// Build the negotiate message (type 1). Domain and workstation are omitted.
pub fn negotiate_message() -> Vec<u8> {
    let mut message = Vec::with_capacity(32);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&1u32.to_le_bytes());
    message.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    message.extend_from_slice(&[0u8; 16]);
    message
}

/// Parse the challenge message (type 2).
pub fn parse_challenge(bytes: &[u8]) -> Result<Challenge, String> {
    if bytes.len() < 32 || &bytes[..8] != SIGNATURE {
        return Err("not an NTLM message".to_string());
    }
    let message_type = read_u32(bytes, 8)?;
    if message_type != 2 {
        return Err(format!("expected NTLM challenge, got message type {}", message_type));
    }

    let flags = read_u32(bytes, 20)?;
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&bytes[24..32]);

    // Target info is optional in old servers' challenges
    let target_info = if bytes.len() >= 48 && flags & NEGOTIATE_TARGET_INFO != 0 {
        let len = read_u16(bytes, 40)? as usize;
        let offset = read_u32(bytes, 44)? as usize;
        bytes
            .get(offset..offset + len)
            .ok_or_else(|| "NTLM target info out of bounds".to_string())?
            .to_vec()
    } else {
        Vec::new()
    };

    Ok(Challenge {
        flags,
        server_challenge,
        target_info,
    })
}

/// Build the authenticate message (type 3) with NTLMv2 responses.
///
/// `timestamp` is a Windows FILETIME; see [`filetime_now`].
pub fn authenticate_message(
    challenge: &Challenge,
    identity: &NtlmIdentity,
    client_challenge: [u8; 8],
    timestamp: u64,
) -> Result<Vec<u8>, String> {
    let key = ntowf_v2(identity)?;

    let blob = client_blob(client_challenge, timestamp, &challenge.target_info);
    let proof = hmac_md5(&key, &[&challenge.server_challenge[..], blob.as_slice()])?;
    let nt_response = [&proof[..], blob.as_slice()].concat();

    let lm_proof = hmac_md5(&key, &[&challenge.server_challenge[..], &client_challenge[..]])?;
    let lm_response = [&lm_proof[..], &client_challenge[..]].concat();

    let domain = utf16le(&identity.domain);
    let user = utf16le(&identity.user);
    let workstation: Vec<u8> = Vec::new();
    let session_key: Vec<u8> = Vec::new();

    let mut header = Vec::with_capacity(AUTHENTICATE_HEADER_LEN);
    let mut payload = Vec::new();
    header.extend_from_slice(SIGNATURE);
    header.extend_from_slice(&3u32.to_le_bytes());

    // Field order in the header is fixed; payload order is ours to choose
    for field in [
        &lm_response,
        &nt_response,
        &domain,
        &user,
        &workstation,
        &session_key,
    ] {
        let offset = AUTHENTICATE_HEADER_LEN + payload.len();
        header.extend_from_slice(&security_buffer(field.len(), offset)?);
        payload.extend_from_slice(field);
    }
    // Keep what both sides support; Unicode strings are always sent
    let flags = (NEGOTIATE_FLAGS & challenge.flags) | NEGOTIATE_UNICODE | NEGOTIATE_NTLM;
    header.extend_from_slice(&flags.to_le_bytes());
    // Version (8 bytes) and MIC (16 bytes) are left zeroed
    header.resize(AUTHENTICATE_HEADER_LEN, 0);

    header.extend_from_slice(&payload);
    Ok(header)
}

/// Current time as a Windows FILETIME (100ns ticks since 1601).
pub fn filetime_now() -> u64 {
    let now = chrono::Utc::now();
    let seconds = (now.timestamp() + FILETIME_EPOCH_OFFSET).max(0) as u64;
    seconds * 10_000_000 + u64::from(now.timestamp_subsec_nanos() / 100)
}

/// Eight random bytes for the client challenge.
pub fn random_client_challenge() -> [u8; 8] {
    fold_halves(uuid::Uuid::new_v4().as_bytes())
}

/// XOR the two halves of a v4 UUID. The version nibble (byte 6) and variant
/// bits (byte 8) are fixed in one half only, so every output bit is random.
fn fold_halves(bytes: &[u8; 16]) -> [u8; 8] {
    std::array::from_fn(|i| bytes[i] ^ bytes[i + 8])
}

fn nt_hash(password: &str) -> [u8; 16] {
    Md4::digest(utf16le(password)).into()
}

fn ntowf_v2(identity: &NtlmIdentity) -> Result<[u8; 16], String> {
    let hash = nt_hash(&identity.password);
    let principal = format!("{}{}", identity.user.to_uppercase(), identity.domain);
    hmac_md5(&hash, &[utf16le(&principal).as_slice()])
}

fn client_blob(client_challenge: [u8; 8], timestamp: u64, target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(&client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0u8; 4]);
    blob
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], String> {
    let mut mac = HmacMd5::new_from_slice(key).map_err(|e| e.to_string())?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

fn security_buffer(len: usize, offset: usize) -> Result<[u8; 8], String> {
    let len = u16::try_from(len).map_err(|_| "NTLM field too long".to_string())?;
    let offset = u32::try_from(offset).map_err(|_| "NTLM message too long".to_string())?;
    let mut buffer = [0u8; 8];
    buffer[..2].copy_from_slice(&len.to_le_bytes());
    buffer[2..4].copy_from_slice(&len.to_le_bytes());
    buffer[4..].copy_from_slice(&offset.to_le_bytes());
    Ok(buffer)
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, String> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| "truncated NTLM message".to_string())
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, String> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| "truncated NTLM message".to_string())
}
