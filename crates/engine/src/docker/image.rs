//! Image reference normalization.

/// Registries whose images are pulled as written.
const KNOWN_REGISTRIES: &[&str] = &["mcr.microsoft.com", "docker.io"];

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Qualifies `image` with `docker.io/` (and `library/` for single-segment
/// names) unless its first segment is a known registry.
pub fn normalize_image(image: &str) -> String {
    let image = image.trim();
    let first_segment = image.split('/').next().unwrap_or_default();
    if image.contains('/') && KNOWN_REGISTRIES.contains(&first_segment) {
        return image.to_string();
    }
    if image.contains('/') {
        format!("{DEFAULT_REGISTRY}/{image}")
    } else {
        format!("{DEFAULT_REGISTRY}/library/{image}")
    }
}

/// Splits a reference into the `fromImage` and `tag` pull parameters.
///
/// Digest references keep the digest in the repository part and carry no tag.
pub fn split_reference(image: &str) -> (String, Option<String>) {
    if image.contains('@') {
        return (image.to_string(), None);
    }
    let name_start = image.rfind('/').map_or(0, |slash| slash + 1);
    match image[name_start..].rfind(':') {
        Some(colon) => {
            let split = name_start + colon;
            (image[..split].to_string(), Some(image[split + 1..].to_string()))
        }
        None => (image.to_string(), Some(DEFAULT_TAG.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifies_hub_images() {
        assert_eq!(normalize_image("ubuntu:18.04"), "docker.io/library/ubuntu:18.04");
        assert_eq!(normalize_image("flowci/agent"), "docker.io/flowci/agent");
        assert_eq!(normalize_image("docker.io/library/mysql:5.6"), "docker.io/library/mysql:5.6");
        assert_eq!(
            normalize_image("mcr.microsoft.com/windows/servercore:ltsc2019"),
            "mcr.microsoft.com/windows/servercore:ltsc2019"
        );
    }

    #[test]
    fn splits_tags_and_digests() {
        assert_eq!(
            split_reference("docker.io/library/ubuntu:18.04"),
            ("docker.io/library/ubuntu".to_string(), Some("18.04".to_string()))
        );
        assert_eq!(
            split_reference("localhost:5000/app"),
            ("localhost:5000/app".to_string(), Some("latest".to_string()))
        );
        assert_eq!(split_reference("docker.io/library/a@sha256:00"), ("docker.io/library/a@sha256:00".to_string(), None));
    }
}
