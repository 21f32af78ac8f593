#![macro_use]

macro_rules! fail {
    ($expr:expr) => {
        return Err(::std::convert::From::from($expr))
    };
}

macro_rules! invalid_rule_error {
    ($desc:expr, $det:expr) => {
        $crate::errors::CacheError::from((
            $crate::errors::ErrorKind::InvalidRules,
            $desc,
            format!("{}", $det),
        ))
    };
}
