use crate::platform::types;

pub fn map_pull_request(pr: octocrab::models::pulls::PullRequest) -> types::PullRequest {
    types::PullRequest {
        number: pr.number,
        title: pr.title.unwrap_or_default(),
        html_url: pr.html_url.map(|u| u.to_string()),
        head_branch: pr.head.ref_field,
        base_branch: pr.base.ref_field,
    }
}
