//! Template parameter extraction.
//!
//! Channel templates carry named placeholders that are filled from the
//! content body and the advisor profile. The body is free text, so the
//! extraction is best-effort: each parameter is tied to a set of marker
//! keywords and takes the first line containing one of them. A parameter
//! whose markers never appear is omitted rather than filled with
//! placeholder text, so the channel template renders without the section
//! instead of showing filler.
//!
//! The matching heuristic is deliberately behind a trait: content formats
//! change, and the policy should be swappable without touching the
//! scheduler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Parameter key for the localized delivery date.
pub const PARAM_DELIVERY_DATE: &str = "delivery_date";
/// Parameter key for the advisor's business name.
pub const PARAM_BUSINESS_NAME: &str = "business_name";
/// Parameter key for the market summary line.
pub const PARAM_MARKET_SUMMARY: &str = "market_summary";
/// Parameter key for the key insight line.
pub const PARAM_KEY_INSIGHT: &str = "key_insight";
/// Parameter key for the actionable focus line.
pub const PARAM_TODAYS_FOCUS: &str = "todays_focus";
/// Parameter key for the advisor's regulatory registration id.
pub const PARAM_REGISTRATION: &str = "registration_id";

/// Extracts structural fragments from a content body.
pub trait ExtractionPolicy: Send + Sync {
    /// Returns the content-derived parameters present in `body`.
    /// Absent fragments are simply not in the map.
    fn extract(&self, body: &str) -> BTreeMap<String, String>;
}

/// Default policy: first line containing a marker keyword, per parameter.
///
/// Matching is case-insensitive and scans lines in order, so a line that
/// matches markers for two parameters fills both.
#[derive(Debug, Clone, Default)]
pub struct KeywordPolicy;

const MARKET_MARKERS: &[&str] = &["sensex", "nifty", "market"];
const INSIGHT_MARKERS: &[&str] = &["insight", "highlight", "opportunity"];
const FOCUS_MARKERS: &[&str] = &["recommend", "consider", "focus"];

impl KeywordPolicy {
    fn first_matching_line(body: &str, markers: &[&str]) -> Option<String> {
        body.lines()
            .map(str::trim)
            .find(|line| {
                let lower = line.to_lowercase();
                markers.iter().any(|marker| lower.contains(marker))
            })
            .filter(|line| !line.is_empty())
            .map(str::to_string)
    }
}

impl ExtractionPolicy for KeywordPolicy {
    fn extract(&self, body: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        if let Some(line) = Self::first_matching_line(body, MARKET_MARKERS) {
            params.insert(PARAM_MARKET_SUMMARY.to_string(), line);
        }
        if let Some(line) = Self::first_matching_line(body, INSIGHT_MARKERS) {
            params.insert(PARAM_KEY_INSIGHT.to_string(), line);
        }
        if let Some(line) = Self::first_matching_line(body, FOCUS_MARKERS) {
            params.insert(PARAM_TODAYS_FOCUS.to_string(), line);
        }
        params
    }
}

/// Profile fields that feed template parameters.
#[derive(Debug, Clone, Default)]
pub struct ProfileFields {
    pub business_name: Option<String>,
    pub registration_id: Option<String>,
}

/// Builds the full parameter map for a delivery: localized date, profile
/// fields, and content-derived fragments. Every field follows the same
/// rule: absent means omitted.
pub fn build_parameters(
    policy: &dyn ExtractionPolicy,
    body: &str,
    profile: &ProfileFields,
    delivery_instant: DateTime<Utc>,
    timezone: Tz,
) -> BTreeMap<String, String> {
    let mut params = policy.extract(body);
    params.insert(
        PARAM_DELIVERY_DATE.to_string(),
        delivery_instant
            .with_timezone(&timezone)
            .format("%B %-d, %Y")
            .to_string(),
    );
    if let Some(name) = profile.business_name.as_deref() {
        if !name.is_empty() {
            params.insert(PARAM_BUSINESS_NAME.to_string(), name.to_string());
        }
    }
    if let Some(reg) = profile.registration_id.as_deref() {
        if !reg.is_empty() {
            params.insert(PARAM_REGISTRATION.to_string(), reg.to_string());
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BODY: &str = "Good morning!\n\
        Sensex closed 320 points up at 81,450.\n\
        Key insight: midcap IT remains undervalued.\n\
        Consider rebalancing debt allocation this week.";

    #[test]
    fn test_extracts_all_three_fragments() {
        let params = KeywordPolicy.extract(BODY);
        assert_eq!(
            params.get(PARAM_MARKET_SUMMARY).map(String::as_str),
            Some("Sensex closed 320 points up at 81,450.")
        );
        assert!(params[PARAM_KEY_INSIGHT].contains("midcap IT"));
        assert!(params[PARAM_TODAYS_FOCUS].contains("rebalancing"));
    }

    #[test]
    fn test_absent_marker_omits_parameter() {
        let params = KeywordPolicy.extract("Good morning!\nHave a great day.");
        assert!(params.is_empty());
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let params = KeywordPolicy.extract("NIFTY holds above 24,800.");
        assert!(params.contains_key(PARAM_MARKET_SUMMARY));
    }

    #[test]
    fn test_one_line_can_fill_two_parameters() {
        // "opportunity" marks the insight slot and "consider" the focus slot.
        let params = KeywordPolicy.extract("Opportunity: consider large-cap banks.");
        assert!(params.contains_key(PARAM_KEY_INSIGHT));
        assert!(params.contains_key(PARAM_TODAYS_FOCUS));
        assert_eq!(params[PARAM_KEY_INSIGHT], params[PARAM_TODAYS_FOCUS]);
    }

    #[test]
    fn test_build_parameters_localizes_date_and_omits_empty_profile() {
        let instant = chrono::Utc.with_ymd_and_hms(2026, 3, 10, 0, 30, 0).unwrap();
        let profile = ProfileFields {
            business_name: Some("Sharma Wealth".to_string()),
            registration_id: None,
        };
        let params = build_parameters(
            &KeywordPolicy,
            BODY,
            &profile,
            instant,
            chrono_tz::Asia::Kolkata,
        );

        // 00:30 UTC is already March 10 in IST.
        assert_eq!(params[PARAM_DELIVERY_DATE], "March 10, 2026");
        assert_eq!(params[PARAM_BUSINESS_NAME], "Sharma Wealth");
        assert!(!params.contains_key(PARAM_REGISTRATION));
    }
}
