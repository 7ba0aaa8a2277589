//! Property tests for the `default:` filter law: the fallback applies
//! exactly when the reference resolves to missing, null, or empty string.

use proptest::prelude::*;
use serde_json::json;
use trinity_expr::{render_value, EvalContext};

proptest! {
    #[test]
    fn default_fires_iff_value_is_empty(present in any::<bool>(), value in "[a-z0-9]{0,8}") {
        let input = if present {
            json!({ "x": value })
        } else {
            json!({})
        };
        let ctx = EvalContext::new(input, json!(null));
        let out = render_value("{{input.x | default:'fb'}}", &ctx).unwrap();

        let expect_fallback = !present || value.is_empty();
        if expect_fallback {
            prop_assert_eq!(out, json!("fb"));
        } else {
            prop_assert_eq!(out, json!(value));
        }
    }

    #[test]
    fn null_always_takes_the_fallback(fallback in "[a-z]{1,8}") {
        let ctx = EvalContext::new(json!({ "x": null }), json!(null));
        let template = format!("{{{{input.x | default:'{fallback}'}}}}");
        let out = render_value(&template, &ctx).unwrap();
        prop_assert_eq!(out, json!(fallback));
    }
}
