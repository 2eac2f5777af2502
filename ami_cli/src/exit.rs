//! Exit-code categories of the driver

use ami_common::AmiError;

pub const ARGUMENT_ERROR: u8 = 1;
pub const PARSE_ERROR: u8 = 2;
pub const OPT_ERROR: u8 = 3;
pub const RUNTIME_ERROR: u8 = 4;

/// Map an error to its exit-code category.
pub fn code_for(error: &AmiError) -> u8 {
    match error {
        AmiError::BadArgument { .. } => ARGUMENT_ERROR,
        AmiError::Parse { .. }
        | AmiError::EmptyCfg
        | AmiError::NoEntryPoint { .. }
        | AmiError::AnonymousBlock { .. } => PARSE_ERROR,
        AmiError::BadLabel { .. }
        | AmiError::BadFlow { .. }
        | AmiError::BadPhi { .. }
        | AmiError::Opt { .. } => OPT_ERROR,
        AmiError::Load { .. }
        | AmiError::UnknownInstruction { .. }
        | AmiError::DivisionByZero { .. } => RUNTIME_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(code_for(&AmiError::bad_argument("ssa", "no")), 1);
        assert_eq!(code_for(&AmiError::parse(3, "bad")), 2);
        assert_eq!(code_for(&AmiError::EmptyCfg), 2);
        assert_eq!(code_for(&AmiError::bad_flow("@a", "broken")), 3);
        assert_eq!(
            code_for(&AmiError::DivisionByZero { block: "@a".into(), index: 0 }),
            4
        );
    }
}
