use openvote_core::Error;

pub fn assert_core_err<T: std::fmt::Debug>(res: Result<T, Error>, msg: &str) {
    let err = res.unwrap_err().to_string();
    assert!(err.contains(msg), "expected error containing {:?}, got {:?}", msg, err);
}
