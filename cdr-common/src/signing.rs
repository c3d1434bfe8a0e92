use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Compute the request signature expected by the collector: the hex encoded HMAC-SHA1 of
/// `timestamp` followed by `salt`, keyed by the access token.
pub fn sign_request(timestamp: &str, salt: &str, access_token: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(access_token.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.as_bytes());
    mac.update(salt.as_bytes());

    hex::encode(mac.finalize().into_bytes())
}
