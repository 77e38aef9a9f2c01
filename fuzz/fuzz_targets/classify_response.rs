#![no_main]

use std::time::Duration;

use fabric_deploy_endpoint::{classify, HttpResponse, Step, ERROR_CODE_HEADER};
use libfuzzer_sys::fuzz_target;

const CODES: [&str; 6] = [
    "TokenExpired",
    "Unauthorized",
    "ItemDisplayNameNotAvailableYet",
    "PrincipalTypeNotSupported",
    "FeatureNotAvailable",
    "EnvironmentLibrariesNotFound",
];

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }
    let status = 200 + u16::from(data[0]) * 2 % 400;
    let long_running = data[1] & 1 == 1;
    let body = String::from_utf8_lossy(&data[3..]).into_owned();
    let response = HttpResponse::new(status, body)
        .with_header(ERROR_CODE_HEADER, CODES[usize::from(data[2]) % CODES.len()])
        .with_header("retry-after", "5");

    let step = classify(
        &response,
        long_running,
        "POST",
        "https://example.invalid/items",
        Duration::from_secs(60),
    );
    if let Step::Throttled { retry_after } = step {
        assert_eq!(status, 429);
        assert_eq!(retry_after, Duration::from_secs(5));
    }
});
