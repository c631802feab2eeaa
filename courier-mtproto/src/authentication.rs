//! Sans-IO auth key generation.
//!
//! # Flow
//!
//! ```text
//! let (req, s1) = authentication::step1()?;
//! // send req, receive ResPq
//! let (req, s2) = authentication::step2(s1, res_pq, dc_id)?;
//! // send req, receive ServerDhParams
//! let (req, s3) = authentication::step3(s2, server_dh_params)?;
//! // send req, receive SetClientDhParamsAnswer
//! let done = authentication::finish(s3, answer)?;
//! ```
//!
//! Each step consumes the previous state, so a failed check leaves nothing
//! half-negotiated behind.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use courier_crypto::dh::{self, DhError};
use courier_crypto::{AuthKey, aes, factorize, generate_key_data_from_nonce, rsa};
use courier_tl::mtproto::{
    ClientDhInnerData, PQInnerDataDc, ReqDhParams, ReqPqMulti, ResPq, ServerDhInnerData, ServerDhParams,
    SetClientDhParams, SetClientDhParamsAnswer,
};
use courier_tl::{Cursor, Deserializable, Serializable};
use num_bigint::BigUint;
use sha1::{Digest, Sha1};

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors that can occur during auth key generation.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidNonce         { got: [u8; 16], expected: [u8; 16] },
    InvalidPqSize        { size: usize },
    Factorization        { pq: u64 },
    UnknownFingerprints  { fingerprints: Vec<i64> },
    RsaPayloadTooLarge   { len: usize },
    DhParamsFail,
    InvalidServerNonce   { got: [u8; 16], expected: [u8; 16] },
    EncryptedResponseNotPadded { len: usize },
    InvalidDhInnerData   { error: courier_tl::deserialize::Error },
    InvalidDhParams      { error: DhError },
    GParameterOutOfRange { value: BigUint, low: BigUint, high: BigUint },
    DhGenRetry,
    DhGenFail,
    InvalidAnswerHash    { got: [u8; 20], expected: [u8; 20] },
    InvalidNewNonceHash  { got: [u8; 16], expected: [u8; 16] },
    Random,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNonce { .. } => write!(f, "nonce mismatch"),
            Self::InvalidPqSize { size } => write!(f, "pq size {size} invalid (expected 8)"),
            Self::Factorization { pq } => write!(f, "could not factorize pq={pq}"),
            Self::UnknownFingerprints { fingerprints } => write!(f, "no known fingerprint in {fingerprints:?}"),
            Self::RsaPayloadTooLarge { len } => write!(f, "p_q_inner_data of {len} bytes too large for RSA_PAD"),
            Self::DhParamsFail => write!(f, "server returned DH params failure"),
            Self::InvalidServerNonce { .. } => write!(f, "server_nonce mismatch"),
            Self::EncryptedResponseNotPadded { len } => {
                write!(f, "encrypted answer len {len} is not 16-byte aligned")
            }
            Self::InvalidDhInnerData { error } => write!(f, "DH inner data deserialization error: {error}"),
            Self::InvalidDhParams { error } => write!(f, "unsafe DH parameters: {error}"),
            Self::GParameterOutOfRange { .. } => write!(f, "DH value outside the safe range"),
            Self::DhGenRetry => write!(f, "DH gen retry requested"),
            Self::DhGenFail => write!(f, "DH gen failed"),
            Self::InvalidAnswerHash { .. } => write!(f, "answer hash mismatch"),
            Self::InvalidNewNonceHash { .. } => write!(f, "new nonce hash mismatch"),
            Self::Random => write!(f, "system random source failed"),
        }
    }
}

fn random<const N: usize>() -> Result<[u8; N], Error> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|_| Error::Random)?;
    Ok(buf)
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// State after step 1.
pub struct Step1 { nonce: [u8; 16] }

/// State after step 2.
pub struct Step2 {
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
}

/// State after step 3.
pub struct Step3 {
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
    gab:          BigUint,
    time_offset:  i32,
}

/// The output of a successful exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    /// The new authorization key.
    pub auth_key:    AuthKey,
    /// Server time minus local time, in seconds.
    pub time_offset: i32,
    /// Initial server salt.
    pub first_salt:  i64,
}

// ─── Step 1: req_pq_multi ────────────────────────────────────────────────────

/// Generate `req_pq_multi`.
pub fn step1() -> Result<(ReqPqMulti, Step1), Error> {
    Ok(do_step1(&random()?))
}

fn do_step1(random: &[u8; 16]) -> (ReqPqMulti, Step1) {
    let nonce = *random;
    (ReqPqMulti { nonce }, Step1 { nonce })
}

// ─── Step 2: req_DH_params ───────────────────────────────────────────────────

/// Process `resPQ` and generate `req_DH_params`.
///
/// `dc_id` goes into `p_q_inner_data_dc`: `+10000` on test servers,
/// negated for media datacenters.
pub fn step2(data: Step1, response: ResPq, dc_id: i32) -> Result<(ReqDhParams, Step2), Error> {
    do_step2(data, response, dc_id, &random()?)
}

fn trim_be(v: u64) -> Vec<u8> {
    let b = v.to_be_bytes();
    let skip = b.iter().position(|&x| x != 0).unwrap_or(7);
    b[skip..].to_vec()
}

fn do_step2(data: Step1, res_pq: ResPq, dc_id: i32, random: &[u8; 256]) -> Result<(ReqDhParams, Step2), Error> {
    let Step1 { nonce } = data;
    check_nonce(&res_pq.nonce, &nonce)?;

    let pq_bytes: [u8; 8] = res_pq.pq.as_slice().try_into()
        .map_err(|_| Error::InvalidPqSize { size: res_pq.pq.len() })?;
    let pq = u64::from_be_bytes(pq_bytes);
    let (p, q) = factorize(pq).ok_or(Error::Factorization { pq })?;

    let mut new_nonce = [0u8; 32];
    new_nonce.copy_from_slice(&random[..32]);
    let mut rnd224 = [0u8; 224];
    rnd224.copy_from_slice(&random[32..]);

    let (fingerprint, key) = res_pq.server_public_key_fingerprints
        .iter()
        .find_map(|&fp| key_for_fingerprint(fp).map(|k| (fp, k)))
        .ok_or_else(|| Error::UnknownFingerprints {
            fingerprints: res_pq.server_public_key_fingerprints.clone(),
        })?;

    let pq_inner = PQInnerDataDc {
        pq: pq_bytes.to_vec(),
        p: trim_be(p),
        q: trim_be(q),
        nonce,
        server_nonce: res_pq.server_nonce,
        new_nonce,
        dc: dc_id,
    }
    .to_bytes();

    let ciphertext = rsa::encrypt_hashed(&pq_inner, &key, &rnd224)
        .ok_or(Error::RsaPayloadTooLarge { len: pq_inner.len() })?;

    Ok((
        ReqDhParams {
            nonce,
            server_nonce: res_pq.server_nonce,
            p: trim_be(p),
            q: trim_be(q),
            public_key_fingerprint: fingerprint,
            encrypted_data: ciphertext,
        },
        Step2 { nonce, server_nonce: res_pq.server_nonce, new_nonce },
    ))
}

// ─── Step 3: set_client_DH_params ────────────────────────────────────────────

/// Process `server_DH_params` and generate `set_client_DH_params`.
pub fn step3(data: Step2, response: ServerDhParams) -> Result<(SetClientDhParams, Step3), Error> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i32;
    do_step3(data, response, &random()?, now)
}

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut sha = Sha1::new();
    sha.update(data);
    sha.finalize().into()
}

fn do_step3(
    data:     Step2,
    response: ServerDhParams,
    random:   &[u8; 272],
    now:      i32,
) -> Result<(SetClientDhParams, Step3), Error> {
    let Step2 { nonce, server_nonce, new_nonce } = data;

    let mut server_dh_ok = match response {
        ServerDhParams::Fail(f) => {
            check_nonce(&f.nonce, &nonce)?;
            check_server_nonce(&f.server_nonce, &server_nonce)?;
            let digest = sha1_of(&new_nonce);
            let mut expected_hash = [0u8; 16];
            expected_hash.copy_from_slice(&digest[4..]);
            check_new_nonce_hash(&f.new_nonce_hash, &expected_hash)?;
            return Err(Error::DhParamsFail);
        }
        ServerDhParams::Ok(x) => x,
    };

    check_nonce(&server_dh_ok.nonce, &nonce)?;
    check_server_nonce(&server_dh_ok.server_nonce, &server_nonce)?;

    let len = server_dh_ok.encrypted_answer.len();
    if len % 16 != 0 || len < 32 {
        return Err(Error::EncryptedResponseNotPadded { len });
    }

    let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    aes::ige_decrypt(&mut server_dh_ok.encrypted_answer, &key, &iv);
    let plain = server_dh_ok.encrypted_answer;

    let mut got_hash = [0u8; 20];
    got_hash.copy_from_slice(&plain[..20]);
    let mut cursor = Cursor::from_slice(&plain[20..]);
    let inner = ServerDhInnerData::deserialize(&mut cursor)
        .map_err(|error| Error::InvalidDhInnerData { error })?;

    let expected_hash = sha1_of(&plain[20..20 + cursor.pos()]);
    if got_hash != expected_hash {
        return Err(Error::InvalidAnswerHash { got: got_hash, expected: expected_hash });
    }

    check_nonce(&inner.nonce, &nonce)?;
    check_server_nonce(&inner.server_nonce, &server_nonce)?;

    let dh_prime = BigUint::from_bytes_be(&inner.dh_prime);
    dh::check_prime_and_generator(&dh_prime, inner.g).map_err(|error| Error::InvalidDhParams { error })?;

    let g = BigUint::from(inner.g as u32);
    let g_a = BigUint::from_bytes_be(&inner.g_a);
    let one = BigUint::from(1u32);
    let safety = &one << (2048 - 64);
    check_g_in_range(&g, &one, &(&dh_prime - &one))?;
    check_g_in_range(&g_a, &one, &(&dh_prime - &one))?;
    check_g_in_range(&g_a, &safety, &(&dh_prime - &safety))?;

    let b = BigUint::from_bytes_be(&random[..256]);
    let g_b = g.modpow(&b, &dh_prime);
    check_g_in_range(&g_b, &one, &(&dh_prime - &one))?;
    check_g_in_range(&g_b, &safety, &(&dh_prime - &safety))?;
    let gab = g_a.modpow(&b, &dh_prime);
    let time_offset = inner.server_time.wrapping_sub(now);

    let client_dh_inner = ClientDhInnerData {
        nonce,
        server_nonce,
        retry_id: 0,
        g_b: g_b.to_bytes_be(),
    }
    .to_bytes();

    let pad_len = (16 - ((20 + client_dh_inner.len()) % 16)) % 16;
    let mut hashed = Vec::with_capacity(20 + client_dh_inner.len() + pad_len);
    hashed.extend_from_slice(&sha1_of(&client_dh_inner));
    hashed.extend_from_slice(&client_dh_inner);
    hashed.extend_from_slice(&random[256..256 + pad_len]);

    aes::ige_encrypt(&mut hashed, &key, &iv);

    Ok((
        SetClientDhParams { nonce, server_nonce, encrypted_data: hashed },
        Step3 { nonce, server_nonce, new_nonce, gab, time_offset },
    ))
}

// ─── finish ──────────────────────────────────────────────────────────────────

/// Verify `dh_gen_*` and produce the key.
pub fn finish(data: Step3, response: SetClientDhParamsAnswer) -> Result<Finished, Error> {
    let Step3 { nonce, server_nonce, new_nonce, gab, time_offset } = data;

    let (answer_nonce, answer_server_nonce, hash, num) = match response {
        SetClientDhParamsAnswer::DhGenOk(x)    => (x.nonce, x.server_nonce, x.new_nonce_hash1, 1),
        SetClientDhParamsAnswer::DhGenRetry(x) => (x.nonce, x.server_nonce, x.new_nonce_hash2, 2),
        SetClientDhParamsAnswer::DhGenFail(x)  => (x.nonce, x.server_nonce, x.new_nonce_hash3, 3),
    };

    check_nonce(&answer_nonce, &nonce)?;
    check_server_nonce(&answer_server_nonce, &server_nonce)?;

    let mut key_bytes = [0u8; 256];
    let gab_bytes = gab.to_bytes_be();
    let skip = 256usize.saturating_sub(gab_bytes.len());
    key_bytes[skip..].copy_from_slice(&gab_bytes[gab_bytes.len().saturating_sub(256)..]);

    let auth_key = AuthKey::from_bytes(key_bytes);
    let expected_hash = auth_key.calc_new_nonce_hash(&new_nonce, num);
    check_new_nonce_hash(&hash, &expected_hash)?;

    let mut salt = [0u8; 8];
    for ((dst, a), b) in salt.iter_mut().zip(&new_nonce[..8]).zip(&server_nonce[..8]) {
        *dst = a ^ b;
    }
    let first_salt = i64::from_le_bytes(salt);

    match num {
        1 => {
            log::info!("[courier-mtproto] auth key {auth_key:?} negotiated");
            Ok(Finished { auth_key, time_offset, first_salt })
        }
        2 => Err(Error::DhGenRetry),
        _ => Err(Error::DhGenFail),
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidNonce { got: *got, expected: *expected })
    }
}
fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidServerNonce { got: *got, expected: *expected })
    }
}
fn check_new_nonce_hash(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidNewNonceHash { got: *got, expected: *expected })
    }
}
fn check_g_in_range(val: &BigUint, lo: &BigUint, hi: &BigUint) -> Result<(), Error> {
    if lo < val && val < hi { Ok(()) } else {
        Err(Error::GParameterOutOfRange { value: val.clone(), low: lo.clone(), high: hi.clone() })
    }
}

/// RSA key by server fingerprint. Includes both production and test DC keys.
#[allow(clippy::unreadable_literal)]
pub fn key_for_fingerprint(fp: i64) -> Option<rsa::Key> {
    Some(match fp {
        // Production DC key (fingerprint -3414540481677951611)
        -3414540481677951611 => rsa::Key::new(
            "29379598170669337022986177149456128565388431120058863768162556424047512191330847455146576344487764408661701890505066208632169112269581063774293102577308490531282748465986139880977280302242772832972539403531316010870401287642763009136156734339538042419388722777357134487746169093539093850251243897188928735903389451772730245253062963384108812842079887538976360465290946139638691491496062099570836476454855996319192747663615955633778034897140982517446405334423701359108810182097749467210509584293428076654573384828809574217079944388301239431309115013843331317877374435868468779972014486325557807783825502498215169806323",
            "65537"
        )?,
        // Test DC key (fingerprint -5595554452916591101)
        -5595554452916591101 => rsa::Key::new(
            "25342889448840415564971689590713473206898847759084779052582026594546022463853940585885215951168491965708222649399180603818074200620463776135424884632162512403163793083921641631564740959529419359595852941166848940585952337613333022396096584117954892216031229237302943701877588456738335398602461675225081791820393153757504952636234951323237820036543581047826906120927972487366805292115792231423684261262330394324750785450942589751755390156647751460719351439969059949569615302809050721500330239005077889855323917509948255722081644689442127297605422579707142646660768825302832201908302295573257427896031830742328565032949",
            "65537"
        )?,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use courier_crypto::dh::KNOWN_PRIME_HEX;
    use courier_tl::mtproto::{DhGenOk, ServerDhParamsOk};

    use super::*;

    const PROD_FINGERPRINT: i64 = -3414540481677951611;
    const SERVER_TIME: i32 = 1_700_000_000;

    fn filled<const N: usize>(seed: u8) -> [u8; N] {
        let mut out = [0u8; N];
        for (i, b) in out.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8).wrapping_mul(31) ^ 0x5a;
        }
        out
    }

    /// Plays the datacenter's half of the exchange.
    struct FakeServer {
        server_nonce: [u8; 16],
        prime: BigUint,
        a: BigUint,
        g: i32,
    }

    impl FakeServer {
        fn new() -> Self {
            Self {
                server_nonce: filled(40),
                prime: BigUint::parse_bytes(KNOWN_PRIME_HEX.as_bytes(), 16).unwrap(),
                a: BigUint::from_bytes_be(&filled::<256>(9)),
                g: 3,
            }
        }

        fn res_pq(&self, nonce: [u8; 16]) -> ResPq {
            ResPq {
                nonce,
                server_nonce: self.server_nonce,
                pq: 1470626929934143021u64.to_be_bytes().to_vec(),
                server_public_key_fingerprints: vec![12345, PROD_FINGERPRINT],
            }
        }

        fn dh_params(&self, nonce: [u8; 16], new_nonce: &[u8; 32]) -> ServerDhParams {
            let g_a = BigUint::from(self.g as u32).modpow(&self.a, &self.prime);
            let inner = ServerDhInnerData {
                nonce,
                server_nonce: self.server_nonce,
                g: self.g,
                dh_prime: self.prime.to_bytes_be(),
                g_a: g_a.to_bytes_be(),
                server_time: SERVER_TIME,
            }
            .to_bytes();

            let mut answer = sha1_of(&inner).to_vec();
            answer.extend(inner);
            answer.resize(answer.len().div_ceil(16) * 16, 0);
            let (key, iv) = generate_key_data_from_nonce(&self.server_nonce, new_nonce);
            aes::ige_encrypt(&mut answer, &key, &iv);
            ServerDhParams::Ok(ServerDhParamsOk { nonce, server_nonce: self.server_nonce, encrypted_answer: answer })
        }

        fn derive_key(&self, req: &SetClientDhParams, new_nonce: &[u8; 32]) -> AuthKey {
            let (key, iv) = generate_key_data_from_nonce(&self.server_nonce, new_nonce);
            let mut data = req.encrypted_data.clone();
            aes::ige_decrypt(&mut data, &key, &iv);
            let inner = ClientDhInnerData::from_bytes(&data[20..]).unwrap();
            let gab = BigUint::from_bytes_be(&inner.g_b).modpow(&self.a, &self.prime).to_bytes_be();
            let mut bytes = [0u8; 256];
            bytes[256 - gab.len()..].copy_from_slice(&gab);
            AuthKey::from_bytes(bytes)
        }
    }

    fn new_nonce_of(random: &[u8; 256]) -> [u8; 32] {
        let mut n = [0u8; 32];
        n.copy_from_slice(&random[..32]);
        n
    }

    #[test]
    fn full_exchange_agrees_on_key() {
        let server = FakeServer::new();
        let (req1, s1) = do_step1(&filled(1));

        let rnd2 = filled::<256>(2);
        let (req2, s2) = do_step2(s1, server.res_pq(req1.nonce), 2, &rnd2).unwrap();
        assert_eq!(req2.p, 1206429347u32.to_be_bytes());
        assert_eq!(req2.q, 1218991343u32.to_be_bytes());
        assert_eq!(req2.public_key_fingerprint, PROD_FINGERPRINT);
        assert_eq!(req2.encrypted_data.len(), 256);

        let new_nonce = new_nonce_of(&rnd2);
        let (req3, s3) = do_step3(s2, server.dh_params(req1.nonce, &new_nonce), &filled(3), SERVER_TIME - 5).unwrap();

        let key = server.derive_key(&req3, &new_nonce);
        let answer = SetClientDhParamsAnswer::DhGenOk(DhGenOk {
            nonce: req1.nonce,
            server_nonce: server.server_nonce,
            new_nonce_hash1: key.calc_new_nonce_hash(&new_nonce, 1),
        });
        let done = finish(s3, answer).unwrap();

        assert_eq!(done.auth_key, key);
        assert_eq!(done.time_offset, 5);
        let mut salt = [0u8; 8];
        for i in 0..8 {
            salt[i] = new_nonce[i] ^ server.server_nonce[i];
        }
        assert_eq!(done.first_salt, i64::from_le_bytes(salt));
    }

    #[test]
    fn echoed_nonce_must_match() {
        let server = FakeServer::new();
        let (_, s1) = do_step1(&filled(1));
        let err = do_step2(s1, server.res_pq([0; 16]), 2, &filled(2)).err().unwrap();
        assert!(matches!(err, Error::InvalidNonce { .. }));
    }

    #[test]
    fn unknown_fingerprints_are_refused() {
        let server = FakeServer::new();
        let (req1, s1) = do_step1(&filled(1));
        let mut res_pq = server.res_pq(req1.nonce);
        res_pq.server_public_key_fingerprints = vec![1, 2];
        let err = do_step2(s1, res_pq, 2, &filled(2)).err().unwrap();
        assert_eq!(err, Error::UnknownFingerprints { fingerprints: vec![1, 2] });
    }

    #[test]
    fn wrong_generator_for_prime_is_refused() {
        let mut server = FakeServer::new();
        server.g = 2;
        let (req1, s1) = do_step1(&filled(1));
        let rnd2 = filled::<256>(2);
        let (_, s2) = do_step2(s1, server.res_pq(req1.nonce), 2, &rnd2).unwrap();
        let err = do_step3(s2, server.dh_params(req1.nonce, &new_nonce_of(&rnd2)), &filled(3), SERVER_TIME)
            .err()
            .unwrap();
        assert_eq!(err, Error::InvalidDhParams { error: DhError::BadGenerator { g: 2 } });
    }

    #[test]
    fn tampered_answer_fails_closed() {
        let server = FakeServer::new();
        let (req1, s1) = do_step1(&filled(1));
        let rnd2 = filled::<256>(2);
        let (_, s2) = do_step2(s1, server.res_pq(req1.nonce), 2, &rnd2).unwrap();
        let ServerDhParams::Ok(mut ok) = server.dh_params(req1.nonce, &new_nonce_of(&rnd2)) else {
            unreachable!()
        };
        ok.encrypted_answer[3] ^= 0x01;
        assert!(do_step3(s2, ServerDhParams::Ok(ok), &filled(3), SERVER_TIME).is_err());
    }

    #[test]
    fn bad_new_nonce_hash_is_refused() {
        let server = FakeServer::new();
        let (req1, s1) = do_step1(&filled(1));
        let rnd2 = filled::<256>(2);
        let (_, s2) = do_step2(s1, server.res_pq(req1.nonce), 2, &rnd2).unwrap();
        let (_, s3) = do_step3(s2, server.dh_params(req1.nonce, &new_nonce_of(&rnd2)), &filled(3), SERVER_TIME).unwrap();
        let answer = SetClientDhParamsAnswer::DhGenOk(DhGenOk {
            nonce: req1.nonce,
            server_nonce: server.server_nonce,
            new_nonce_hash1: [0; 16],
        });
        assert!(matches!(finish(s3, answer), Err(Error::InvalidNewNonceHash { .. })));
    }
}
