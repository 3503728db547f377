use kreflect_core::{ListResult, ObjectKey};

/// One polling cycle: the key count, then one key per line.
pub fn render_keys(mut keys: Vec<ObjectKey>) -> String {
    keys.sort_unstable();
    let mut out = format!(" there are {} items\n", keys.len());
    for k in keys {
        out.push_str(k.as_str());
        out.push('\n');
    }
    out
}

/// Startup listing printed once after connecting.
pub fn render_summary(kind: &str, list: &ListResult) -> String {
    let mut out = format!("There are {} {} objects in the cluster\n", list.items.len(), kind);
    out.push_str(&format!("resource version: {}\n", list.version));
    let mut items: Vec<_> = list.items.iter().collect();
    items.sort_by_key(|o| o.key());
    for o in items {
        let phase = o.field("status.phase").unwrap_or_else(|| "-".to_string());
        let host = o.field("status.hostIP").unwrap_or_else(|| "-".to_string());
        out.push_str(&format!("{}, phase:{}, host:{}\n", o.key(), phase, host));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kreflect_core::{CollectionVersion, MirroredObject};

    #[test]
    fn keys_report() {
        let out = render_keys(vec![ObjectKey::from("default/b"), ObjectKey::from("default/a")]);
        assert_eq!(out, " there are 2 items\ndefault/a\ndefault/b\n");
        assert_eq!(render_keys(Vec::new()), " there are 0 items\n");
    }

    #[test]
    fn summary_lines() {
        let running = MirroredObject::new(Some("default"), "web-0")
            .with_raw(serde_json::json!({ "status": { "phase": "Running", "hostIP": "10.0.0.7" } }));
        let pending = MirroredObject::new(Some("default"), "job-1");
        let list = ListResult { items: vec![running, pending], version: CollectionVersion::new("812") };
        let out = render_summary("Pod", &list);
        assert_eq!(
            out,
            "There are 2 Pod objects in the cluster\n\
             resource version: 812\n\
             default/job-1, phase:-, host:-\n\
             default/web-0, phase:Running, host:10.0.0.7\n"
        );
    }
}
