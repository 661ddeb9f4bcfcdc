//! Propagation helpers for [`Outcome`](asupersync::Outcome).
//!
//! `?` cannot forward the `Cancelled` and `Panicked` arms of an outcome, so
//! async code in this workspace early-returns through these macros instead
//! of spelling out the four-arm match at every call site.

/// Unwrap `Outcome::Ok`, returning any other arm from the enclosing
/// function unchanged.
#[macro_export]
macro_rules! try_outcome {
    ($outcome:expr) => {
        match $outcome {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
#[macro_export]
macro_rules! try_result {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => return $crate::Outcome::Err(e.into()),
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::{Error, Outcome};

    fn doubled(input: Outcome<i32, Error>) -> Outcome<i32, Error> {
        let value = try_outcome!(input);
        Outcome::Ok(value * 2)
    }

    fn parsed(input: Result<i32, Error>) -> Outcome<i32, Error> {
        let value = try_result!(input);
        Outcome::Ok(value + 1)
    }

    #[test]
    fn test_try_outcome_forwards_errors() {
        assert!(matches!(doubled(Outcome::Ok(4)), Outcome::Ok(8)));
        assert!(matches!(
            doubled(Outcome::Err(Error::Custom("boom".into()))),
            Outcome::Err(Error::Custom(_))
        ));
    }

    #[test]
    fn test_try_result_converts_err() {
        assert!(matches!(parsed(Ok(1)), Outcome::Ok(2)));
        assert!(matches!(
            parsed(Err(Error::Custom("bad".into()))),
            Outcome::Err(_)
        ));
    }
}
