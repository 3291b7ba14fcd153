//! Rule safety rejection: a head variable bound only by a negated join
//! must fail analysis rather than silently producing an unsafe plan.

use c4::error::{Error, UsageError};

#[test]
fn head_variable_only_in_negated_body_is_rejected() {
    let client = c4::Client::make(0).unwrap();
    client.install_str("p(int8) keys(0); q(int8) keys(0);").unwrap();

    let err = client.install_str("q(A) :- notin p(A);").unwrap_err();
    assert!(
        matches!(err, Error::Usage(UsageError::UnsafeHeadVariable(_, _)) | Error::Usage(UsageError::NoNonNegatedJoin(_))),
        "expected a safety-rejection error, got {err:?}"
    );

    // The rejected install must not have defined anything usable.
    assert!(client.dump_table("q").unwrap().is_empty());

    client.destroy();
}
