mod host_address;
mod row_log_id;
mod shard_id;
mod subscription_id;

pub use host_address::HostAddress;
pub use row_log_id::RowLogId;
pub use shard_id::ShardId;
pub use subscription_id::SubscriptionId;

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! serde_round_trip {
        ($name:ident, $val:expr) => {
            mod $name {
                use super::*;

                #[test]
                fn msgpack() {
                    let val = $val;
                    let bytes = rmp_serde::to_vec(&val).unwrap();
                    let decoded = rmp_serde::from_slice(&bytes).unwrap();
                    assert_eq!(val, decoded);
                }

                #[test]
                fn json() {
                    let val = $val;
                    let json = serde_json::to_string(&val).unwrap();
                    let decoded = serde_json::from_str(&json).unwrap();
                    assert_eq!(val, decoded);
                }
            }
        };
    }

    serde_round_trip!(row_log_id, RowLogId::new("records"));
    serde_round_trip!(subscription_id, SubscriptionId::new("indexer"));
    serde_round_trip!(host_address, HostAddress::new("10.0.0.1", 9000));

    #[test]
    fn host_address_display_and_parse() {
        let addr = HostAddress::new("indexer-1.local", 4242);
        assert_eq!(addr.to_string(), "indexer-1.local:4242");
        assert_eq!(HostAddress::parse("indexer-1.local:4242"), Some(addr));
        assert_eq!(HostAddress::parse("no-port"), None);
        assert_eq!(HostAddress::parse(":80"), None);
        assert_eq!(HostAddress::parse("host:notaport"), None);
    }

    #[test]
    fn subscription_id_ordering_is_lexicographic() {
        let mut ids = vec![
            SubscriptionId::new("links"),
            SubscriptionId::new("blobs"),
            SubscriptionId::new("index"),
        ];
        ids.sort();
        assert_eq!(
            ids.iter().map(|i| i.as_ref()).collect::<Vec<_>>(),
            vec!["blobs", "index", "links"]
        );
    }
}
