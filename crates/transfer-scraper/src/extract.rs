//! Timeline extraction inside a browser session.

use crate::renderer::BrowserSession;
use crate::types::{AttemptFailure, FailureKind, RawRecord, Target};
use crate::validator::classify_page_text;

/// Maximum scroll passes used to load more posts.
const MAX_SCROLLS: usize = 5;

/// Collects posts currently rendered on a profile timeline into the
/// canonical raw record shape.
const EXTRACT_POSTS_JS: &str = r#"(() => {
  const num = (el) => {
    if (!el) return null;
    const label = el.getAttribute('aria-label') || el.textContent || '';
    const m = label.replace(/,/g, '').match(/([\d.]+)\s*([KkMm])?/);
    if (!m) return 0;
    let n = parseFloat(m[1]);
    if (m[2] && /k/i.test(m[2])) n *= 1e3;
    if (m[2] && /m/i.test(m[2])) n *= 1e6;
    return Math.round(n);
  };
  const out = [];
  for (const article of document.querySelectorAll('article[data-testid="tweet"]')) {
    const link = article.querySelector('a[href*="/status/"] time')?.closest('a');
    const href = link ? link.getAttribute('href') : '';
    const idMatch = href.match(/\/status\/(\d+)/);
    const handleMatch = href.match(/^\/([^/]+)\/status/);
    const nameBlock = article.querySelector('[data-testid="User-Name"]');
    const textEl = article.querySelector('[data-testid="tweetText"]');
    const time = article.querySelector('time');
    const media = [];
    for (const img of article.querySelectorAll('[data-testid="tweetPhoto"] img')) {
      media.push({ type: 'photo', url: img.src, alt_text: img.alt || null });
    }
    for (const video of article.querySelectorAll('video')) {
      media.push({ type: 'video', url: video.src || null, preview_url: video.poster || null });
    }
    out.push({
      id: idMatch ? idMatch[1] : null,
      text: textEl ? textEl.innerText : null,
      created_at: time ? time.getAttribute('datetime') : null,
      author: {
        handle: handleMatch ? handleMatch[1] : null,
        name: nameBlock ? (nameBlock.querySelector('span')?.innerText || null) : null,
        verified: !!(nameBlock && nameBlock.querySelector('[data-testid="icon-verified"]')),
      },
      media,
      metrics: {
        reply_count: num(article.querySelector('[data-testid="reply"]')),
        retweet_count: num(article.querySelector('[data-testid="retweet"]')),
        like_count: num(article.querySelector('[data-testid="like"]')),
        impression_count: num(article.querySelector('a[href*="/analytics"]')),
      },
    });
  }
  return out;
})()"#;

const SCROLL_JS: &str = "window.scrollBy(0, document.body.scrollHeight); document.querySelectorAll('article[data-testid=\"tweet\"]').length";

/// Phrases shown on profile pages that do not exist or are suspended.
const MISSING_ACCOUNT_PHRASES: &[&str] = &[
    "this account doesn\u{2019}t exist",
    "this account doesn't exist",
    "account suspended",
];

/// Paths the platform redirects to instead of serving a timeline to a
/// session it has flagged.
const CHALLENGE_PATHS: &[&str] = &["/login", "/i/flow/login", "/account/access", "/i/flow/consent"];

pub fn timeline_url(base_url: &str, target: &Target) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), target.handle())
}

fn failure(kind: FailureKind, e: impl std::fmt::Display) -> AttemptFailure {
    AttemptFailure::new(kind, e.to_string())
}

/// The navigation ended on a login or verification wall.
fn challenge_redirect(final_url: &str) -> Option<String> {
    let parsed = url::Url::parse(final_url).ok()?;
    let path = parsed.path().trim_end_matches('/');
    CHALLENGE_PATHS
        .iter()
        .any(|p| path.eq_ignore_ascii_case(p))
        .then(|| path.to_string())
}

/// Load `target`'s timeline in `session` and collect up to `count` posts.
///
/// Page text is only consulted when no posts were extracted, so post
/// content never turns a good page into a failure.
pub async fn extract_timeline(
    session: &mut dyn BrowserSession,
    base_url: &str,
    target: &Target,
    count: usize,
    timeout_ms: u64,
) -> Result<Vec<RawRecord>, AttemptFailure> {
    let url = timeline_url(base_url, target);
    let navigation = session.navigate(&url, timeout_ms).await.map_err(|e| {
        let msg = e.to_string();
        if msg.contains("timed out") {
            AttemptFailure::timeout(timeout_ms)
        } else {
            failure(FailureKind::Network, msg)
        }
    })?;
    if let Some(path) = challenge_redirect(&navigation.final_url) {
        return Err(AttemptFailure::new(
            FailureKind::Blocked,
            format!("{url} redirected to {path}"),
        ));
    }

    let mut rendered = 0u64;
    for _ in 0..MAX_SCROLLS {
        let now = session
            .execute_js(SCROLL_JS)
            .await
            .map_err(|e| failure(FailureKind::Structural, e))?
            .as_u64()
            .unwrap_or(0);
        if now as usize >= count || now == rendered {
            break;
        }
        rendered = now;
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    }

    let value = session
        .execute_js(EXTRACT_POSTS_JS)
        .await
        .map_err(|e| failure(FailureKind::Structural, e))?;
    match value {
        serde_json::Value::Array(mut records) if !records.is_empty() => {
            records.truncate(count);
            Ok(records)
        }
        serde_json::Value::Array(records) => {
            diagnose_empty_page(session, &url, target).await?;
            Ok(records)
        }
        other => {
            diagnose_empty_page(session, &url, target).await?;
            Err(AttemptFailure::new(
                FailureKind::Structural,
                format!("timeline extraction returned {other} instead of a list"),
            ))
        }
    }
}

/// Explain a page that rendered no posts: a throttle or block notice, or a
/// missing account. `Ok` means the timeline is genuinely empty.
async fn diagnose_empty_page(
    session: &dyn BrowserSession,
    url: &str,
    target: &Target,
) -> Result<(), AttemptFailure> {
    let text = session
        .page_text()
        .await
        .map_err(|e| failure(FailureKind::Structural, e))?;
    if let Some((kind, phrase)) = classify_page_text(&text) {
        return Err(AttemptFailure::new(
            kind,
            format!("{url} answered with `{phrase}`"),
        ));
    }
    let lowered = text.to_lowercase();
    if MISSING_ACCOUNT_PHRASES.iter().any(|p| lowered.contains(p)) {
        return Err(AttemptFailure::new(
            FailureKind::InvalidTarget,
            format!("{target} doesn't exist or is suspended"),
        ));
    }
    Ok(())
}
