/// Continues to next loop iteration on an `Err(_)` result.
#[macro_export]
macro_rules! continue_on_err {
    ($res:expr, $err:tt) => {{
        match $res {
            Ok(res) => res,
            Err(err) => {
                let err_msg = $err;
                log::warn!("{err_msg}: {err}");
                continue;
            }
        }
    }};
}

/// Breaks out of the enclosing loop on an `Err(_)` result.
#[macro_export]
macro_rules! break_on_err {
    ($res:expr, $err:tt) => {{
        match $res {
            Ok(res) => res,
            Err(err) => {
                let err_msg = $err;
                log::warn!("{err_msg}: {err}");
                break;
            }
        }
    }};
}
