mod check_state;
mod feed;
mod oracle;

pub use check_state::{read_last_check, write_last_check};
pub use feed::{
    latest_release_endpoint, parse_github_release, GitHubReleaseFeed, PublishedRelease,
    ReleaseFeed,
};
pub use oracle::{SystemInfo, UpdateCheck, VersionOracle};
