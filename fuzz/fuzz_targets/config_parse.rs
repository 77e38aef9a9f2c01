#![no_main]

use fabric_deploy::config::DeployConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = toml::from_str::<DeployConfig>(text) {
        let _ = config.validate();
        let _ = config.unpublish_options();
        assert!(!config.kinds_in_scope().is_empty());
    }
});
