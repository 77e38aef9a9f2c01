#![no_main]

use fabric_deploy::references::{
    dataflow_source, guid_strings, is_guid, replace_default_workspace_ids, DEFAULT_WORKSPACE_ID,
};
use libfuzzer_sys::fuzz_target;

const TARGET: &str = "12345678-1234-1234-1234-123456789abc";

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // A found source always carries two valid GUIDs
    if let Ok(Some(source)) = dataflow_source(text, "fuzz") {
        assert!(is_guid(&source.workspace_id));
        assert!(is_guid(&source.dataflow_id));
    }

    // Replacement never introduces the placeholder
    let replaced = replace_default_workspace_ids(text, TARGET);
    if !text.contains(DEFAULT_WORKSPACE_ID) {
        assert_eq!(replaced, text);
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        for id in guid_strings(&value) {
            assert!(is_guid(&id));
        }
    }
});
