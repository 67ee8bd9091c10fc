//! Host capability detection.
//!
//! Architecture-dependent behaviour is resolved once, when the context is
//! built, instead of being scattered through the build sequence as
//! conditional compilation.

/// Capabilities resolved for the host the toolstack runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether the CPUID feature policy must be applied on build.
    pub cpuid_policy: bool,
    /// Human-readable reason for the resolved state
    pub reason: String,
}

impl Capabilities {
    /// Detect capabilities from the compilation target.
    ///
    /// CPUID policy exists on x86 and x86_64 only.
    pub fn detect() -> Self {
        let x86 = cfg!(any(target_arch = "x86", target_arch = "x86_64"));
        let reason = if x86 {
            format!("{} host: cpuid policy available", std::env::consts::ARCH)
        } else {
            format!("{} host: no cpuid policy", std::env::consts::ARCH)
        };
        Self {
            cpuid_policy: x86,
            reason,
        }
    }

    /// Detect, then apply an explicit override from configuration.
    pub fn resolve(cpuid_override: Option<bool>) -> Self {
        let detected = Self::detect();
        match cpuid_override {
            Some(forced) if forced != detected.cpuid_policy => {
                tracing::debug!(
                    detected = detected.cpuid_policy,
                    forced,
                    "cpuid policy capability overridden by options"
                );
                Self {
                    cpuid_policy: forced,
                    reason: format!("overridden by options ({})", detected.reason),
                }
            }
            _ => detected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_matches_target() {
        let caps = Capabilities::detect();
        assert_eq!(
            caps.cpuid_policy,
            cfg!(any(target_arch = "x86", target_arch = "x86_64"))
        );
        assert!(caps.reason.contains(std::env::consts::ARCH));
    }

    #[test]
    fn test_override() {
        assert!(Capabilities::resolve(Some(true)).cpuid_policy);
        assert!(!Capabilities::resolve(Some(false)).cpuid_policy);
        assert_eq!(Capabilities::resolve(None), Capabilities::detect());
    }
}
