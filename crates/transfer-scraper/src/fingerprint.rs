//! Randomized browser fingerprints applied to each new session.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
];

/// Timezone and the locale that plausibly goes with it.
const REGIONS: &[(&str, &str)] = &[
    ("Europe/London", "en-GB"),
    ("Europe/Madrid", "es-ES"),
    ("Europe/Rome", "it-IT"),
    ("Europe/Paris", "fr-FR"),
    ("Europe/Berlin", "de-DE"),
    ("America/New_York", "en-US"),
];

const VIEWPORTS: &[(u32, u32)] = &[(1920, 1080), (1536, 864), (1440, 900), (1366, 768), (1280, 800)];

const CORES: &[u32] = &[4, 8, 12, 16];

/// Browser identity presented by one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
    pub timezone: String,
    pub locale: String,
    pub viewport: (u32, u32),
    /// Seed for per-session canvas readback noise.
    pub canvas_noise_seed: u32,
    pub webrtc_disabled: bool,
    pub hardware_concurrency: u32,
}

impl Fingerprint {
    pub fn random() -> Self {
        Self::random_with(&mut rand::thread_rng())
    }

    pub fn random_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let user_agent = USER_AGENTS.choose(rng).copied().unwrap_or(USER_AGENTS[0]);
        let (timezone, locale) = REGIONS.choose(rng).copied().unwrap_or(REGIONS[0]);
        let viewport = VIEWPORTS.choose(rng).copied().unwrap_or(VIEWPORTS[0]);
        let cores = CORES.choose(rng).copied().unwrap_or(8);
        Self {
            user_agent: user_agent.to_string(),
            timezone: timezone.to_string(),
            locale: locale.to_string(),
            viewport,
            canvas_noise_seed: rng.gen(),
            webrtc_disabled: true,
            hardware_concurrency: cores,
        }
    }

    /// Script injected before any page script runs.
    ///
    /// Hides the automation flag, pins navigator properties to this
    /// fingerprint, perturbs canvas readback and removes WebRTC peer
    /// connections when `webrtc_disabled` is set.
    pub fn stealth_script(&self) -> String {
        let languages = format!(
            "[\"{}\", \"{}\"]",
            self.locale,
            self.locale.split('-').next().unwrap_or("en")
        );
        let mut script = format!(
            r#"(() => {{
  Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined }});
  Object.defineProperty(navigator, 'languages', {{ get: () => {languages} }});
  Object.defineProperty(navigator, 'hardwareConcurrency', {{ get: () => {cores} }});
  window.chrome = window.chrome || {{ runtime: {{}} }};
  const seed = {seed};
  const toDataURL = HTMLCanvasElement.prototype.toDataURL;
  HTMLCanvasElement.prototype.toDataURL = function (...args) {{
    const ctx = this.getContext('2d');
    if (ctx && this.width > 0 && this.height > 0) {{
      const px = ctx.getImageData(0, 0, 1, 1);
      px.data[0] = (px.data[0] + (seed % 3)) % 256;
      ctx.putImageData(px, 0, 0);
    }}
    return toDataURL.apply(this, args);
  }};
"#,
            cores = self.hardware_concurrency,
            seed = self.canvas_noise_seed,
        );
        if self.webrtc_disabled {
            script.push_str(
                "  delete window.RTCPeerConnection;\n  delete window.webkitRTCPeerConnection;\n",
            );
        }
        script.push_str("})();");
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_seeded_is_deterministic() {
        let a = Fingerprint::random_with(&mut StdRng::seed_from_u64(7));
        let b = Fingerprint::random_with(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_locale_matches_timezone() {
        for seed in 0..20 {
            let fp = Fingerprint::random_with(&mut StdRng::seed_from_u64(seed));
            assert!(REGIONS.contains(&(fp.timezone.as_str(), fp.locale.as_str())));
        }
    }

    #[test]
    fn test_stealth_script() {
        let fp = Fingerprint::random();
        let script = fp.stealth_script();
        assert!(script.contains("webdriver"));
        assert!(script.contains(&fp.canvas_noise_seed.to_string()));
        assert!(script.contains("RTCPeerConnection"));

        let open = Fingerprint {
            webrtc_disabled: false,
            ..fp
        };
        assert!(!open.stealth_script().contains("RTCPeerConnection"));
    }
}
