//! Request and response code taxonomy.
//!
//! The numeric values are wire contract and must never change: remote peers
//! match on them directly. Response codes follow the HTTP convention below
//! 600 and use the 9xx block for application-level conditions.

/// Request expecting exactly one response.
pub const REQUEST: u16 = 10;
/// Transactional request (request semantics plus atomicity at the peer).
pub const TRANSACTION: u16 = 11;
/// Command request (request semantics, side effect expected).
pub const COMMAND: u16 = 12;
/// Fire-and-forget event notification; never answered.
pub const EVENT: u16 = 80;

/// Success.
pub const OK: u16 = 200;
/// Malformed or inapplicable request.
pub const BAD_REQUEST: u16 = 400;
/// Access denied.
pub const ACCESS_DENIED: u16 = 401;
/// Forbidden.
pub const FORBIDDEN: u16 = 403;
/// Address does not resolve.
pub const NOT_FOUND: u16 = 404;
/// Payload present but fails validation.
pub const DATA_INVALID: u16 = 422;
/// A required lock could not be acquired within its timeout.
pub const LOCKED: u16 = 423;
/// Too many requests.
pub const TOO_MANY_REQUESTS: u16 = 429;
/// Unanticipated failure.
pub const INTERNAL_ERROR: u16 = 500;
/// Operation recognized but not implemented.
pub const NOT_IMPLEMENTED: u16 = 501;
/// Target temporarily not available.
pub const NOT_AVAILABLE: u16 = 503;
/// Execution exceeded its timeout.
pub const EXECUTION_TIMEOUT: u16 = 504;
/// Generic service-level failure.
pub const EXECUTION_FAILED: u16 = 550;
/// Element, link or mirror already exists.
pub const ALREADY_EXISTS: u16 = 901;

/// `true` for the request-code set (10, 11, 12, 80).
pub fn is_request(code: u16) -> bool {
    matches!(code, REQUEST | TRANSACTION | COMMAND | EVENT)
}

pub fn is_informational(code: u16) -> bool {
    (100..200).contains(&code)
}

pub fn is_success(code: u16) -> bool {
    (200..300).contains(&code)
}

pub fn is_redirect(code: u16) -> bool {
    (300..400).contains(&code)
}

pub fn is_client_error(code: u16) -> bool {
    (400..500).contains(&code)
}

pub fn is_server_error(code: u16) -> bool {
    (500..600).contains(&code)
}

pub fn is_application_error(code: u16) -> bool {
    (900..1000).contains(&code)
}

/// Any client, server or application error.
pub fn is_error(code: u16) -> bool {
    is_client_error(code) || is_server_error(code) || is_application_error(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_ranges() {
        assert!(is_success(OK));
        assert!(!is_success(NOT_FOUND));
        assert!(is_client_error(NOT_FOUND));
        assert!(is_client_error(LOCKED));
        assert!(is_server_error(INTERNAL_ERROR));
        assert!(is_server_error(EXECUTION_FAILED));
        assert!(is_application_error(ALREADY_EXISTS));
        assert!(is_informational(101));
        assert!(is_redirect(302));
    }

    #[test]
    fn error_covers_all_error_ranges() {
        for code in [BAD_REQUEST, NOT_FOUND, DATA_INVALID, LOCKED, INTERNAL_ERROR, ALREADY_EXISTS]
        {
            assert!(is_error(code), "{code} should classify as error");
        }
        assert!(!is_error(OK));
        assert!(!is_error(REQUEST));
    }

    #[test]
    fn request_codes_are_not_errors() {
        for code in [REQUEST, TRANSACTION, COMMAND, EVENT] {
            assert!(is_request(code));
            assert!(!is_error(code));
        }
        assert!(!is_request(OK));
    }
}
