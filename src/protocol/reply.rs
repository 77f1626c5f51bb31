use bson::{Bson, Document};

use crate::error::{DriverError, DriverResult};

/// Turn a command reply with `ok != 1` into [`DriverError::Command`].
pub fn check_ok(reply: &Document) -> DriverResult<()> {
    let ok = match reply.get("ok") {
        Some(value) => as_f64(value).map(|v| v == 1.0).unwrap_or(false),
        None => false,
    };
    if ok {
        return Ok(());
    }

    Err(DriverError::Command {
        code: reply.get("code").and_then(as_i64).unwrap_or(0) as i32,
        code_name: reply.get_str("codeName").unwrap_or_default().to_string(),
        message: reply
            .get_str("errmsg")
            .unwrap_or("command failed without an error message")
            .to_string(),
    })
}

/// Read any numeric BSON value as an integer.
pub fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        Bson::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn test_ok_variants() {
        assert!(check_ok(&doc! { "ok": 1.0 }).is_ok());
        assert!(check_ok(&doc! { "ok": 1 }).is_ok());
        assert!(check_ok(&doc! { "ok": 1_i64 }).is_ok());
        assert!(check_ok(&doc! { "ok": true }).is_ok());
    }

    #[test]
    fn test_failure_is_typed() {
        let err = check_ok(&doc! {
            "ok": 0.0,
            "errmsg": "ns does not exist",
            "code": 26,
            "codeName": "NamespaceNotFound",
        })
        .unwrap_err();

        match err {
            DriverError::Command {
                code,
                code_name,
                message,
            } => {
                assert_eq!(code, 26);
                assert_eq!(code_name, "NamespaceNotFound");
                assert_eq!(message, "ns does not exist");
            }
            other => panic!("Expected command error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_ok_is_failure() {
        assert!(matches!(
            check_ok(&doc! { "n": 1 }),
            Err(DriverError::Command { code: 0, .. })
        ));
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(as_i64(&Bson::Int32(7)), Some(7));
        assert_eq!(as_i64(&Bson::Double(7.0)), Some(7));
        assert_eq!(as_i64(&Bson::Double(7.5)), None);
        assert_eq!(as_i64(&Bson::String("7".into())), None);
    }
}
