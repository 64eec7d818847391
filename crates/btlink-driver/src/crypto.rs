//! Elliptic-curve operations offloaded from the co-processor.
//!
//! Key material on the wire is little-endian, one coordinate or scalar at a
//! time; the curve primitives work big-endian. Every coordinate and scalar
//! is reversed independently on the way in and on the way out.

use std::fmt;

use btlink_frame::{ControlKind, ControlMessage};
use elliptic_curve::ecdh::diffie_hellman;
use elliptic_curve::sec1::{FromEncodedPoint, ModulusSize, ToEncodedPoint};
use elliptic_curve::{AffinePoint, CurveArithmetic, FieldBytesSize, PublicKey, SecretKey};
use p192::NistP192;
use p256::NistP256;
use rand::rngs::OsRng;

/// Size of the request id trailing every DH request.
pub const REQUEST_ID_SIZE: usize = 4;

/// Offloaded crypto operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoOp {
    P192PublicKey,
    P192DhKey,
    P256PublicKey,
    P256DhKey,
}

impl CryptoOp {
    pub fn from_kind(kind: ControlKind) -> Option<Self> {
        match kind {
            ControlKind::GenP192PublicKey => Some(Self::P192PublicKey),
            ControlKind::GenP192DhKey => Some(Self::P192DhKey),
            ControlKind::GenP256PublicKey => Some(Self::P256PublicKey),
            ControlKind::GenP256DhKey => Some(Self::P256DhKey),
            _ => None,
        }
    }

    pub const fn kind(self) -> ControlKind {
        match self {
            Self::P192PublicKey => ControlKind::GenP192PublicKey,
            Self::P192DhKey => ControlKind::GenP192DhKey,
            Self::P256PublicKey => ControlKind::GenP256PublicKey,
            Self::P256DhKey => ControlKind::GenP256DhKey,
        }
    }

    /// Bytes in one scalar or coordinate.
    pub const fn scalar_len(self) -> usize {
        match self {
            Self::P192PublicKey | Self::P192DhKey => 24,
            Self::P256PublicKey | Self::P256DhKey => 32,
        }
    }

    pub const fn is_dh(self) -> bool {
        matches!(self, Self::P192DhKey | Self::P256DhKey)
    }

    /// Request payload following the first control message.
    pub const fn request_len(self) -> usize {
        if self.is_dh() {
            self.scalar_len() * 3 + REQUEST_ID_SIZE
        } else {
            0
        }
    }

    /// Payload of a successful response.
    pub const fn response_len(self) -> usize {
        if self.is_dh() {
            self.scalar_len()
        } else {
            self.scalar_len() * 3
        }
    }
}

impl fmt::Display for CryptoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind().name())
    }
}

/// Result code carried in word 0 of a crypto response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CryptoStatus {
    Success = 0,
    InvalidPublicKey = -1,
    InvalidPrivateKey = -2,
    IncompleteRequest = -5,
    Failed = -22,
}

impl CryptoStatus {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::InvalidPublicKey,
            -2 => Self::InvalidPrivateKey,
            -5 => Self::IncompleteRequest,
            _ => Self::Failed,
        }
    }
}

/// Outcome of one offloaded operation, ready to go on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoResponse {
    pub op: CryptoOp,
    pub status: CryptoStatus,
    /// Request id for DH responses, payload length for public keys.
    pub word1: u32,
    pub payload: Vec<u8>,
}

impl CryptoResponse {
    pub fn failure(op: CryptoOp, status: CryptoStatus, id: u32) -> Self {
        Self {
            op,
            status,
            word1: id,
            payload: Vec::new(),
        }
    }

    /// Fragment 0 with status and word 1, then the payload on success.
    pub fn to_messages(&self) -> Vec<ControlMessage> {
        let kind = self.op.kind();
        let mut head = ControlMessage::new(kind, 0);
        head.set_word(0, self.status.code() as u32);
        head.set_word(1, self.word1);

        let mut msgs = vec![head];
        if self.status == CryptoStatus::Success {
            msgs.extend(ControlMessage::fragments(kind, &self.payload));
        }
        msgs
    }
}

/// DH request payload: remote public key, private key, request id.
pub fn dh_request(remote_public: &[u8], private: &[u8], id: u32) -> Vec<u8> {
    let mut request = Vec::with_capacity(remote_public.len() + private.len() + REQUEST_ID_SIZE);
    request.extend_from_slice(remote_public);
    request.extend_from_slice(private);
    request.extend_from_slice(&id.to_le_bytes());
    request
}

/// Run `op` over its request payload.
pub fn process(op: CryptoOp, request: &[u8]) -> CryptoResponse {
    match op {
        CryptoOp::P192PublicKey => public_key_response::<NistP192>(op),
        CryptoOp::P256PublicKey => public_key_response::<NistP256>(op),
        CryptoOp::P192DhKey => dh_key_response::<NistP192>(op, request),
        CryptoOp::P256DhKey => dh_key_response::<NistP256>(op, request),
    }
}

fn public_key_response<C>(op: CryptoOp) -> CryptoResponse
where
    C: CurveArithmetic,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
    FieldBytesSize<C>: ModulusSize,
{
    let (public, private) = generate_keypair::<C>();
    let mut payload = public;
    payload.extend_from_slice(&private);
    CryptoResponse {
        op,
        status: CryptoStatus::Success,
        word1: payload.len() as u32,
        payload,
    }
}

fn dh_key_response<C>(op: CryptoOp, request: &[u8]) -> CryptoResponse
where
    C: CurveArithmetic,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
    FieldBytesSize<C>: ModulusSize,
{
    let scalar = op.scalar_len();
    let key_end = scalar * 2;
    let id_at = key_end + scalar;
    if request.len() < op.request_len() {
        return CryptoResponse::failure(op, CryptoStatus::IncompleteRequest, 0);
    }
    let id = u32::from_le_bytes([
        request[id_at],
        request[id_at + 1],
        request[id_at + 2],
        request[id_at + 3],
    ]);

    match dh_key::<C>(&request[..key_end], &request[key_end..id_at]) {
        Ok(secret) => CryptoResponse {
            op,
            status: CryptoStatus::Success,
            word1: id,
            payload: secret,
        },
        Err(status) => CryptoResponse::failure(op, status, id),
    }
}

/// Fresh key pair as `(X || Y, private)`, all little-endian.
pub fn generate_keypair<C>() -> (Vec<u8>, Vec<u8>)
where
    C: CurveArithmetic,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
    FieldBytesSize<C>: ModulusSize,
{
    let secret = SecretKey::<C>::random(&mut OsRng);
    let point = secret.public_key().to_encoded_point(false);
    let public = swap_coordinates(&point.as_bytes()[1..]);
    let private = reversed(&secret.to_bytes());
    (public, private)
}

/// Shared secret from a little-endian `X || Y` remote key and a
/// little-endian private scalar.
///
/// The remote key is checked to be on the curve before anything else.
pub fn dh_key<C>(remote_public: &[u8], private: &[u8]) -> Result<Vec<u8>, CryptoStatus>
where
    C: CurveArithmetic,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
    FieldBytesSize<C>: ModulusSize,
{
    let mut sec1 = Vec::with_capacity(remote_public.len() + 1);
    sec1.push(0x04);
    sec1.extend_from_slice(&swap_coordinates(remote_public));
    let public =
        PublicKey::<C>::from_sec1_bytes(&sec1).map_err(|_| CryptoStatus::InvalidPublicKey)?;

    let secret = SecretKey::<C>::from_slice(&reversed(private))
        .map_err(|_| CryptoStatus::InvalidPrivateKey)?;

    let shared = diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    Ok(reversed(shared.raw_secret_bytes()))
}

fn reversed(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// Reverse X and Y independently.
fn swap_coordinates(xy: &[u8]) -> Vec<u8> {
    let (x, y) = xy.split_at(xy.len() / 2);
    let mut out = reversed(x);
    out.extend(y.iter().rev());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const P256_GX: &str = "6b17d1f2e12c4247f8bce6e563a440f277037d812deb33a0f4a13945d898c296";
    const P256_GY: &str = "4fe342e2fe1a7f9b8ee7eb4a7c0f9e162bce33576b315ececbb6406837bf51f5";

    fn le(hex_be: &str) -> Vec<u8> {
        let mut bytes = hex::decode(hex_be).unwrap();
        bytes.reverse();
        bytes
    }

    fn agree<C>()
    where
        C: CurveArithmetic,
        AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
        FieldBytesSize<C>: ModulusSize,
    {
        let (pub_a, priv_a) = generate_keypair::<C>();
        let (pub_b, priv_b) = generate_keypair::<C>();
        assert_ne!(priv_a, priv_b);

        let ab = dh_key::<C>(&pub_b, &priv_a).unwrap();
        let ba = dh_key::<C>(&pub_a, &priv_b).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), priv_a.len());
    }

    #[test]
    fn p192_key_agreement() {
        agree::<NistP192>();
    }

    #[test]
    fn p256_key_agreement() {
        agree::<NistP256>();
    }

    #[test]
    fn generator_times_one_is_generator_x() {
        let mut generator = le(P256_GX);
        generator.extend(le(P256_GY));
        let mut one = vec![0u8; 32];
        one[0] = 1;

        let shared = dh_key::<NistP256>(&generator, &one).unwrap();
        assert_eq!(shared, le(P256_GX));
    }

    #[test]
    fn off_curve_key_rejected() {
        let mut bogus = vec![0u8; 64];
        bogus[0] = 1;
        bogus[32] = 1;
        let private = generate_keypair::<NistP256>().1;
        assert_eq!(
            dh_key::<NistP256>(&bogus, &private),
            Err(CryptoStatus::InvalidPublicKey)
        );
    }

    #[test]
    fn zero_private_key_rejected() {
        let public = generate_keypair::<NistP192>().0;
        assert_eq!(
            dh_key::<NistP192>(&public, &[0u8; 24]),
            Err(CryptoStatus::InvalidPrivateKey)
        );
    }

    #[test]
    fn op_sizes() {
        assert_eq!(CryptoOp::P192DhKey.request_len(), 76);
        assert_eq!(CryptoOp::P256DhKey.request_len(), 100);
        assert_eq!(CryptoOp::P192PublicKey.response_len(), 72);
        assert_eq!(CryptoOp::P256PublicKey.response_len(), 96);
        assert_eq!(CryptoOp::P256DhKey.response_len(), 32);
    }

    #[test]
    fn dh_request_echoes_id() {
        let (public, _) = generate_keypair::<NistP256>();
        let (_, private) = generate_keypair::<NistP256>();
        let request = dh_request(&public, &private, 0xdead_beef);
        assert_eq!(request.len(), CryptoOp::P256DhKey.request_len());

        let response = process(CryptoOp::P256DhKey, &request);
        assert_eq!(response.status, CryptoStatus::Success);
        assert_eq!(response.word1, 0xdead_beef);
        assert_eq!(response.payload.len(), 32);

        let msgs = response.to_messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].word(0), 0);
        assert_eq!(msgs[0].word(1), 0xdead_beef);
        assert_eq!(msgs[2].fragment, 2);
    }

    #[test]
    fn short_request_is_incomplete() {
        let response = process(CryptoOp::P192DhKey, &[0u8; 40]);
        assert_eq!(response.status, CryptoStatus::IncompleteRequest);
        // Failures carry no payload fragments.
        assert_eq!(response.to_messages().len(), 1);
        assert_eq!(response.to_messages()[0].word(0) as i32, -5);
    }

    #[test]
    fn public_key_response_layout() {
        let response = process(CryptoOp::P192PublicKey, &[]);
        assert_eq!(response.status, CryptoStatus::Success);
        assert_eq!(response.word1, 72);
        assert_eq!(response.to_messages().len(), 1 + 5);
    }

    #[test]
    fn status_codes() {
        assert_eq!(CryptoStatus::Failed.code(), -22);
        assert_eq!(CryptoStatus::from_code(-2), CryptoStatus::InvalidPrivateKey);
        assert_eq!(CryptoStatus::from_code(-99), CryptoStatus::Failed);
    }
}
