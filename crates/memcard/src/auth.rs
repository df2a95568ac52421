//! Host side of the card's challenge-response handshake.
//!
//! Every block is 8 bytes. `E(k, iv, p)` is one block of 3DES-EDE2 in CBC
//! form, `Enc_k(iv ^ p)`, and `D` its inverse.

use std::time::{Duration, Instant};

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::TdesEde2;
use log::{debug, warn};

use crate::config::AuthConfig;
use crate::device::{AuthPort, AuthRequest};
use crate::{Error, Result};

pub type Block = [u8; 8];

/// Fixed test block both sides encrypt during the exchange.
pub const TEST_BLOCK: Block = [0xDE, 0xAD, 0xC0, 0xDE, 0xDE, 0xAD, 0xC0, 0xDE];

/// Sub-command numbers of the exchange, in protocol order.
pub(crate) mod step {
    pub const BEGIN: u8 = 0x00;
    pub const GET_VECTOR: u8 = 0x01;
    pub const GET_PLAIN: u8 = 0x02;
    pub const NONCE_READY: u8 = 0x03;
    pub const GET_NONCE: u8 = 0x04;
    pub const CHALLENGE: u8 = 0x05;
    pub const PUT_C1: u8 = 0x06;
    pub const PUT_C2: u8 = 0x07;
    pub const PUT_C3: u8 = 0x0B;
    pub const GET_R1: u8 = 0x0F;
    pub const GET_R2: u8 = 0x11;
    pub const GET_R3: u8 = 0x13;
    pub const FINISH: u8 = 0x14;
}

/// Pre-shared key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthKeys {
    pub key_left: [u8; 16],
    pub iv_left: Block,
    pub key_right: [u8; 16],
    pub iv_right: Block,
    pub challenge_iv: Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    ChallengeIssued,
    Authenticated,
    /// The card answered but its responses did not verify.
    Failed,
}

fn xor(a: &Block, b: &Block) -> Block {
    let mut out = [0u8; 8];
    for (out, (a, b)) in out.iter_mut().zip(a.iter().zip(b)) {
        *out = a ^ b;
    }
    out
}

pub(crate) fn encrypt(key: &[u8; 16], iv: &Block, block: &Block) -> Block {
    let cipher = TdesEde2::new(GenericArray::from_slice(key));
    let mut data = GenericArray::clone_from_slice(&xor(iv, block));
    cipher.encrypt_block(&mut data);
    let mut out = [0u8; 8];
    out.copy_from_slice(&data);
    out
}

pub(crate) fn decrypt(key: &[u8; 16], iv: &Block, block: &Block) -> Block {
    let cipher = TdesEde2::new(GenericArray::from_slice(key));
    let mut data = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut data);
    let mut out = [0u8; 8];
    out.copy_from_slice(&data);
    xor(iv, &out)
}

/// Per-exchange key from the card's vector and plain blocks.
pub(crate) fn derive_auth_key(keys: &AuthKeys, vector: &Block, plain: &Block) -> [u8; 16] {
    let mixed = xor(vector, plain);
    let mut auth_key = [0u8; 16];
    auth_key[..8].copy_from_slice(&encrypt(&keys.key_left, &keys.iv_left, &mixed));
    auth_key[8..].copy_from_slice(&encrypt(&keys.key_right, &keys.iv_right, &mixed));
    auth_key
}

pub struct AuthSession {
    keys: Option<AuthKeys>,
    timeout: Duration,
    retries: u32,
    state: AuthState,
    session_key: Option<Block>,
}

struct Exchange<'a, P> {
    port: &'a mut P,
    deadline: Instant,
}

impl<P: AuthPort> Exchange<'_, P> {
    fn send(&mut self, request: AuthRequest) -> Result<Option<Block>> {
        let response = self.port.exchange(request)?;
        if Instant::now() > self.deadline {
            return Err(Error::Media {
                page: None,
                reason: format!("authentication timed out at {request:?}"),
            });
        }
        Ok(response)
    }

    fn step(&mut self, number: u8) -> Result<()> {
        self.send(AuthRequest::Step(number)).map(|_| ())
    }

    fn get(&mut self, number: u8) -> Result<Block> {
        self.send(AuthRequest::Get(number))?.ok_or_else(|| Error::Media {
            page: None,
            reason: format!("no response to authentication request {number:#04x}"),
        })
    }

    fn put(&mut self, number: u8, block: Block) -> Result<()> {
        self.send(AuthRequest::Put(number, block)).map(|_| ())
    }
}

impl AuthSession {
    pub fn new(keys: Option<AuthKeys>, timeout: Duration, retries: u32) -> Self {
        Self {
            keys,
            timeout,
            retries,
            state: AuthState::Unauthenticated,
            session_key: None,
        }
    }

    /// Keys are optional; a partially filled `[auth]` section is an error.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let configured = [
            &config.key_left,
            &config.iv_left,
            &config.key_right,
            &config.iv_right,
            &config.challenge_iv,
        ]
        .iter()
        .any(|field| field.is_some());
        let keys = if configured {
            Some(config.keys()?)
        } else {
            None
        };
        Ok(Self::new(keys, config.timeout(), config.retries))
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    pub fn session_key(&self) -> Option<Block> {
        self.session_key
    }

    /// Gate for mutating operations.
    pub fn require(&self) -> Result<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(Error::AuthRequired)
        }
    }

    pub fn reset(&mut self) {
        self.state = AuthState::Unauthenticated;
        self.session_key = None;
    }

    /// Runs one full handshake. Transport errors and timeouts leave the
    /// session unauthenticated; a response that fails verification leaves
    /// it `Failed` until [`AuthSession::reset`].
    pub fn authenticate<P: AuthPort>(&mut self, port: &mut P) -> Result<Block> {
        if self.state == AuthState::Failed {
            return Err(Error::AuthFailed(
                "a previous handshake failed; reset before retrying".to_string(),
            ));
        }
        let keys = self
            .keys
            .clone()
            .ok_or_else(|| Error::Config("no authentication keys configured".to_string()))?;

        self.reset();
        let mut exchange = Exchange {
            port,
            deadline: Instant::now() + self.timeout,
        };
        match self.handshake(&mut exchange, &keys) {
            Ok(session_key) => {
                self.state = AuthState::Authenticated;
                self.session_key = Some(session_key);
                debug!("card authenticated");
                Ok(session_key)
            }
            Err(err) => {
                self.state = match err {
                    Error::AuthFailed(_) => AuthState::Failed,
                    _ => AuthState::Unauthenticated,
                };
                Err(err)
            }
        }
    }

    /// Repeats [`AuthSession::authenticate`] while it fails without the card
    /// rejecting the exchange outright.
    pub fn authenticate_with_retries<P: AuthPort>(&mut self, port: &mut P) -> Result<Block> {
        let attempts = self.retries.max(1);
        let mut attempt = 1;
        loop {
            match self.authenticate(port) {
                Ok(key) => return Ok(key),
                Err(err)
                    if self.state == AuthState::Unauthenticated
                        && attempt < attempts
                        && !matches!(err, Error::Config(_)) =>
                {
                    warn!("authentication attempt {attempt}/{attempts} failed: {err}");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn handshake<P: AuthPort>(&mut self, exchange: &mut Exchange<P>, keys: &AuthKeys) -> Result<Block> {
        exchange.send(AuthRequest::Authorize)?;
        exchange.step(step::BEGIN)?;
        let vector = exchange.get(step::GET_VECTOR)?;
        let plain = exchange.get(step::GET_PLAIN)?;
        let auth_key = derive_auth_key(keys, &vector, &plain);

        exchange.step(step::NONCE_READY)?;
        let nonce = exchange.get(step::GET_NONCE)?;

        let c3 = encrypt(&auth_key, &keys.challenge_iv, &TEST_BLOCK);
        let c2 = encrypt(&auth_key, &c3, &nonce);
        let c1 = encrypt(&auth_key, &c2, &vector);

        exchange.step(step::CHALLENGE)?;
        exchange.put(step::PUT_C1, c1)?;
        exchange.put(step::PUT_C2, c2)?;
        self.state = AuthState::ChallengeIssued;
        for number in 0x08..=0x0A {
            exchange.step(number)?;
        }
        exchange.put(step::PUT_C3, c3)?;
        for number in 0x0C..=0x0E {
            exchange.step(number)?;
        }
        let r1 = exchange.get(step::GET_R1)?;
        exchange.step(0x10)?;
        let r2 = exchange.get(step::GET_R2)?;
        exchange.step(0x12)?;
        let r3 = exchange.get(step::GET_R3)?;
        exchange.step(step::FINISH)?;

        if decrypt(&auth_key, &keys.challenge_iv, &r1) != nonce {
            return Err(Error::AuthFailed("card did not echo the nonce".to_string()));
        }
        if decrypt(&auth_key, &r1, &r2) != TEST_BLOCK {
            return Err(Error::AuthFailed("card response does not verify".to_string()));
        }
        let session_key = decrypt(&auth_key, &r2, &r3);
        exchange.send(AuthRequest::Sentinel)?;
        Ok(session_key)
    }
}
