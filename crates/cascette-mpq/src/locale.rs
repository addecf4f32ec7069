//! Locale identifiers for locale-tagged archive entries
//!
//! Archive entries carry a Win32 LCID. This module translates between the
//! numeric codes the engine stores and the symbolic culture names callers
//! use (`0x409` <-> `"en_US"`). Name lookup ignores ASCII case and accepts
//! `-` in place of `_`, so `"EN-us"` resolves to `0x409`.

use std::fmt;

use crate::error::{MpqError, Result};

/// Code used for entries without a locale
pub const NEUTRAL: u16 = 0x0000;

/// Name of the neutral locale
pub const NEUTRAL_NAME: &str = "Neutral";

/// Locale table, sorted by code
pub static LOCALES: &[(u16, &str)] = &[
    (0x0000, NEUTRAL_NAME),
    (0x0401, "ar_SA"),
    (0x0402, "bg_BG"),
    (0x0403, "ca_ES"),
    (0x0404, "zh_TW"),
    (0x0405, "cs_CZ"),
    (0x0406, "da_DK"),
    (0x0407, "de_DE"),
    (0x0408, "el_GR"),
    (0x0409, "en_US"),
    (0x040A, "es_ES_tradnl"),
    (0x040B, "fi_FI"),
    (0x040C, "fr_FR"),
    (0x040D, "he_IL"),
    (0x040E, "hu_HU"),
    (0x040F, "is_IS"),
    (0x0410, "it_IT"),
    (0x0411, "ja_JP"),
    (0x0412, "ko_KR"),
    (0x0413, "nl_NL"),
    (0x0414, "nb_NO"),
    (0x0415, "pl_PL"),
    (0x0416, "pt_BR"),
    (0x0417, "rm_CH"),
    (0x0418, "ro_RO"),
    (0x0419, "ru_RU"),
    (0x041A, "hr_HR"),
    (0x041B, "sk_SK"),
    (0x041C, "sq_AL"),
    (0x041D, "sv_SE"),
    (0x041E, "th_TH"),
    (0x041F, "tr_TR"),
    (0x0420, "ur_PK"),
    (0x0421, "id_ID"),
    (0x0422, "uk_UA"),
    (0x0423, "be_BY"),
    (0x0424, "sl_SI"),
    (0x0425, "et_EE"),
    (0x0426, "lv_LV"),
    (0x0427, "lt_LT"),
    (0x0429, "fa_IR"),
    (0x042A, "vi_VN"),
    (0x042B, "hy_AM"),
    (0x042D, "eu_ES"),
    (0x042F, "mk_MK"),
    (0x0436, "af_ZA"),
    (0x0437, "ka_GE"),
    (0x0438, "fo_FO"),
    (0x0439, "hi_IN"),
    (0x043A, "mt_MT"),
    (0x043E, "ms_MY"),
    (0x043F, "kk_KZ"),
    (0x0441, "sw_KE"),
    (0x0445, "bn_IN"),
    (0x0446, "pa_IN"),
    (0x0447, "gu_IN"),
    (0x0449, "ta_IN"),
    (0x044A, "te_IN"),
    (0x044B, "kn_IN"),
    (0x044E, "mr_IN"),
    (0x0456, "gl_ES"),
    (0x0461, "ne_NP"),
    (0x0464, "fil_PH"),
    (0x0801, "ar_IQ"),
    (0x0804, "zh_CN"),
    (0x0807, "de_CH"),
    (0x0809, "en_GB"),
    (0x080A, "es_MX"),
    (0x080C, "fr_BE"),
    (0x0810, "it_CH"),
    (0x0813, "nl_BE"),
    (0x0814, "nn_NO"),
    (0x0816, "pt_PT"),
    (0x081D, "sv_FI"),
    (0x0C01, "ar_EG"),
    (0x0C04, "zh_HK"),
    (0x0C07, "de_AT"),
    (0x0C09, "en_AU"),
    (0x0C0A, "es_ES"),
    (0x0C0C, "fr_CA"),
    (0x1001, "ar_LY"),
    (0x1004, "zh_SG"),
    (0x1007, "de_LU"),
    (0x1009, "en_CA"),
    (0x100A, "es_GT"),
    (0x100C, "fr_CH"),
    (0x1401, "ar_DZ"),
    (0x1404, "zh_MO"),
    (0x1407, "de_LI"),
    (0x1409, "en_NZ"),
    (0x140A, "es_CR"),
    (0x140C, "fr_LU"),
    (0x1801, "ar_MA"),
    (0x1809, "en_IE"),
    (0x180A, "es_PA"),
    (0x1C01, "ar_TN"),
    (0x1C09, "en_ZA"),
    (0x1C0A, "es_DO"),
    (0x2001, "ar_OM"),
    (0x2009, "en_JM"),
    (0x200A, "es_VE"),
    (0x2401, "ar_YE"),
    (0x240A, "es_CO"),
    (0x2801, "ar_SY"),
    (0x2809, "en_BZ"),
    (0x280A, "es_PE"),
    (0x2C01, "ar_JO"),
    (0x2C09, "en_TT"),
    (0x2C0A, "es_AR"),
    (0x3001, "ar_LB"),
    (0x3009, "en_ZW"),
    (0x300A, "es_EC"),
    (0x3401, "ar_KW"),
    (0x3409, "en_PH"),
    (0x340A, "es_CL"),
    (0x3801, "ar_AE"),
    (0x380A, "es_UY"),
    (0x3C01, "ar_BH"),
    (0x3C0A, "es_PY"),
    (0x4001, "ar_QA"),
    (0x4009, "en_IN"),
    (0x400A, "es_BO"),
    (0x440A, "es_SV"),
    (0x480A, "es_HN"),
    (0x4809, "en_SG"),
    (0x4C0A, "es_NI"),
    (0x500A, "es_PR"),
];

/// A locale given either as a numeric code or as a culture name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocaleRef<'a> {
    /// Numeric LCID
    Code(u32),
    /// Culture name such as `"en_US"` or `"ko-kr"`
    Name(&'a str),
}

impl From<u32> for LocaleRef<'_> {
    fn from(code: u32) -> Self {
        Self::Code(code)
    }
}

impl From<u16> for LocaleRef<'_> {
    fn from(code: u16) -> Self {
        Self::Code(u32::from(code))
    }
}

impl<'a> From<&'a str> for LocaleRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a String> for LocaleRef<'a> {
    fn from(name: &'a String) -> Self {
        Self::Name(name.as_str())
    }
}

impl fmt::Display for LocaleRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "0x{code:04x}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Find the code for a culture name
///
/// Comparison ignores ASCII case and treats `-` as `_`.
pub fn code_for_name(name: &str) -> Option<u16> {
    let normalized = name.replace('-', "_");
    LOCALES
        .iter()
        .find(|(_, candidate)| candidate.eq_ignore_ascii_case(&normalized))
        .map(|&(code, _)| code)
}

/// Find the canonical name for a code
pub fn name_for_code(code: u32) -> Option<&'static str> {
    let code = u16::try_from(code).ok()?;
    LOCALES
        .binary_search_by_key(&code, |&(candidate, _)| candidate)
        .ok()
        .map(|index| LOCALES[index].1)
}

/// Translate a locale into the numeric code the engine expects
///
/// Numeric input is returned unchanged. Missing input is the neutral locale.
pub fn resolve<'a>(input: Option<impl Into<LocaleRef<'a>>>) -> Result<u32> {
    match input.map(Into::into) {
        None => Ok(u32::from(NEUTRAL)),
        Some(LocaleRef::Code(code)) => Ok(code),
        Some(LocaleRef::Name(name)) => code_for_name(name)
            .map(u32::from)
            .ok_or_else(|| MpqError::UnknownLocale(name.to_string())),
    }
}

/// Translate a locale into its canonical culture name
///
/// Missing input is the neutral locale. Codes and names without a table
/// entry fail with [`MpqError::UnknownLocale`].
pub fn format<'a>(input: Option<impl Into<LocaleRef<'a>>>) -> Result<&'static str> {
    let Some(input) = input.map(Into::into) else {
        return Ok(NEUTRAL_NAME);
    };

    let code = match input {
        LocaleRef::Code(code) => code,
        LocaleRef::Name(name) => u32::from(
            code_for_name(name).ok_or_else(|| MpqError::UnknownLocale(name.to_string()))?,
        ),
    };

    name_for_code(code).ok_or_else(|| MpqError::UnknownLocale(input.to_string()))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_table_is_sorted_and_unique() {
        assert!(LOCALES.windows(2).all(|pair| pair[0].0 < pair[1].0));

        let names: HashSet<String> = LOCALES
            .iter()
            .map(|(_, name)| name.to_ascii_lowercase())
            .collect();
        assert_eq!(names.len(), LOCALES.len());
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve(Some("en_US")).unwrap(), 0x409);
        assert_eq!(resolve(Some("EN-us")).unwrap(), 0x409);
        assert_eq!(resolve(Some("fr_FR")).unwrap(), 1036);
        assert_eq!(resolve(Some(0x409u32)).unwrap(), 0x409);
        assert_eq!(resolve(Some("Neutral")).unwrap(), 0);
        assert_eq!(resolve(None::<&str>).unwrap(), 0);
    }

    #[test]
    fn test_resolve_passes_unknown_codes_through() {
        assert_eq!(resolve(Some(0xBEEFu32)).unwrap(), 0xBEEF);
    }

    #[test]
    fn test_resolve_unknown_name() {
        let err = resolve(Some("xx_XX")).expect_err("unknown name should fail");
        assert!(matches!(err, MpqError::UnknownLocale(name) if name == "xx_XX"));
    }

    #[test]
    fn test_format() {
        assert_eq!(format(Some(1036u32)).unwrap(), "fr_FR");
        assert_eq!(format(Some("fr_FR")).unwrap(), "fr_FR");
        assert_eq!(format(Some("Ko-Kr")).unwrap(), "ko_KR");
        assert_eq!(format(Some(0u32)).unwrap(), "Neutral");
        assert_eq!(format(None::<u32>).unwrap(), "Neutral");
    }

    #[test]
    fn test_format_unknown_code() {
        assert!(matches!(
            format(Some(0x0001u32)),
            Err(MpqError::UnknownLocale(_))
        ));
        assert!(matches!(
            format(Some(0x1_0409u32)),
            Err(MpqError::UnknownLocale(_))
        ));
    }

    #[test]
    fn test_round_trip_every_entry() {
        for &(code, name) in LOCALES {
            let formatted = format(Some(code)).unwrap();
            assert_eq!(formatted, name);
            assert_eq!(resolve(Some(formatted)).unwrap(), u32::from(code));
            assert_eq!(format(Some(resolve(Some(name)).unwrap())).unwrap(), name);
        }
    }

    #[cfg(test)]
    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn name_lookup_ignores_case_and_separator(
                index in 0..LOCALES.len(),
                upper in any::<bool>()
            ) {
                let (code, name) = LOCALES[index];
                let mangled = name.replace('_', "-");
                let mangled = if upper {
                    mangled.to_ascii_uppercase()
                } else {
                    mangled.to_ascii_lowercase()
                };
                prop_assert_eq!(resolve(Some(mangled.as_str())).unwrap(), u32::from(code));
            }
        }
    }
}
