//! `<lang>:<code>` cell arguments.

use std::str::FromStr;

use tandem_core::Language;

/// One cell given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct CellArg {
    pub language: Language,
    pub code: String,
}

impl FromStr for CellArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lang, code) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <lang>:<code>, got {:?}", s))?;
        Ok(Self {
            language: lang.parse()?,
            // shells make literal newlines awkward
            code: code.replace("\\n", "\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cell() {
        let cell: CellArg = "sql:SELECT 1".parse().unwrap();
        assert_eq!(cell.language, Language::Sql);
        assert_eq!(cell.code, "SELECT 1");
    }

    #[test]
    fn test_code_may_contain_colons_and_newlines() {
        let cell: CellArg = "script:let m = #{a: 1};\\nm.a".parse().unwrap();
        assert_eq!(cell.language, Language::Script);
        assert_eq!(cell.code, "let m = #{a: 1};\nm.a");
    }

    #[test]
    fn test_rejects_unknown_language() {
        assert!("cobol:DISPLAY".parse::<CellArg>().is_err());
        assert!("no separator".parse::<CellArg>().is_err());
    }
}
