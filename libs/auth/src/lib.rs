use std::{collections::HashMap, marker::PhantomData};

use anyhow::{anyhow, Error};
use headers::authorization::{Bearer, Credentials};
use http::{header, HeaderValue, Request, Response, StatusCode};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tower_http::validate_request::ValidateRequest;

use crate::claims::{Claims, Mode, MODE_ALL};

pub mod access;
pub mod claims;

/// Operator name used when authentication is switched off
pub const ANONYMOUS: &str = "anonymous";
pub use api::request::{OPERATOR_HEADER, TOKEN_QUERY};

/// Static bearer token bound to one operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorToken {
    pub operator: String,
    pub token: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
}

fn default_mode() -> Mode {
    MODE_ALL
}

pub struct Keys {
    encoding: EncodingKey,
}

impl Keys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
        }
    }

    pub fn token(self, claims: Claims) -> Result<String, Error> {
        encode(&Header::default(), &claims, &self.encoding).map_err(|e| anyhow!(e))
    }
}

pub struct ManyValidate<ResBody> {
    open: bool,
    tokens: HashMap<String, (String, Mode)>,
    decoding: DecodingKey,
    _ty: PhantomData<fn() -> ResBody>,
}

impl<ResBody> ManyValidate<ResBody> {
    pub fn new(secret: String, operators: Vec<OperatorToken>) -> Self {
        Self {
            open: secret.is_empty() && operators.is_empty(),
            tokens: operators
                .into_iter()
                .map(|o| (o.token, (o.operator, o.mode)))
                .collect(),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            _ty: PhantomData,
        }
    }

    fn claims_for(&self, token: &str) -> Option<Claims> {
        if let Some((operator, mode)) = self.tokens.get(token) {
            return Some(Claims {
                sub: operator.clone(),
                exp: 0,
                mode: *mode,
            });
        }
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .ok()
            .map(|data| data.claims)
    }
}

impl<ResBody> Clone for ManyValidate<ResBody> {
    fn clone(&self) -> Self {
        Self {
            open: self.open,
            tokens: self.tokens.clone(),
            decoding: self.decoding.clone(),
            _ty: PhantomData,
        }
    }
}

fn bearer_token<B>(request: &Request<B>) -> Option<String> {
    if let Some(bearer) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(Bearer::decode)
    {
        return Some(bearer.token().to_string());
    }
    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| match pair.split_once('=') {
            Some((TOKEN_QUERY, value)) if !value.is_empty() => Some(value.to_string()),
            _ => None,
        })
    })
}

fn header_operator(value: Option<&HeaderValue>) -> String {
    value
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

impl<B: Default> ValidateRequest<B> for ManyValidate<B> {
    type ResponseBody = B;

    fn validate(&mut self, request: &mut Request<B>) -> Result<(), Response<Self::ResponseBody>> {
        if self.open {
            let operator = header_operator(request.headers().get(OPERATOR_HEADER));
            request.extensions_mut().insert(Claims {
                sub: operator,
                exp: 0,
                mode: MODE_ALL,
            });
            return Ok(());
        }

        match bearer_token(request).and_then(|token| self.claims_for(&token)) {
            Some(claims) => {
                request.extensions_mut().insert(claims);
                Ok(())
            }
            None => {
                let mut res = Response::new(B::default());
                *res.status_mut() = StatusCode::UNAUTHORIZED;
                Err(res)
            }
        }
    }
}
