use serde::{Deserialize, Serialize};

/// Device authentication endpoint, relative to a server URL.
pub const AUTH_REQUESTS_PATH: &str = "/api/devices/v1/authentication/auth_requests";

/// Header carrying the base64 signature of the request body.
pub const SIGNATURE_HEADER: &str = "X-MEN-Signature";

/// Body of an authentication request. `id_data` is the identity key/value
/// map serialized to JSON and embedded as a string, per the device API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub id_data: String,
    pub pubkey: String,
    pub tenant_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_shape() {
        let request = AuthRequest {
            id_data: r#"{"mac":"aa:bb:cc:dd:ee:ff"}"#.to_string(),
            pubkey: "-----BEGIN PUBLIC KEY-----\n...".to_string(),
            tenant_token: "token".to_string(),
        };
        let body = serde_json::to_value(&request).unwrap();

        // The identity JSON rides along as an escaped string, not an object.
        assert!(body["id_data"].is_string());
        assert_eq!(body["tenant_token"], "token");
    }
}
