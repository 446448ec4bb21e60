//! Build metadata reported by `version_get`.

use strata_api::VersionResponse;

/// Current version of the instance API.
pub const API_VERSION: i64 = 4;

/// Oldest instance API version this agent still serves.
pub const API_MIN_VERSION: i64 = 1;

/// Version info of this build. Git commit and build date come from the
/// `STRATA_GIT_COMMIT` and `STRATA_BUILD_DATE` build-time variables.
pub fn version_info() -> VersionResponse {
    VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_commit: option_env!("STRATA_GIT_COMMIT")
            .unwrap_or("unknown")
            .to_string(),
        build_date: option_env!("STRATA_BUILD_DATE")
            .unwrap_or("unknown")
            .to_string(),
        api_version: API_VERSION,
        api_min_version: API_MIN_VERSION,
    }
}
