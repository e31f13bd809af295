//! Property-based checks of batch responses and entity tags.

use crate::common::{CALENDAR, bridge, event, get, put_event, response_count};
use dav_store_bridge::protocol::header;
use dav_store_bridge::{DavMethod, DavRequest};
use http::StatusCode;
use proptest::collection::btree_set;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// One entry per item, in the order the items were sent.
    #[test]
    fn batch_entries_follow_request_order(uids in btree_set("[a-z]{3,8}", 1..8), reverse in any::<bool>()) {
        let mut uids: Vec<String> = uids.into_iter().collect();
        if reverse {
            uids.reverse();
        }
        let body: String = uids.iter().map(|uid| event(uid)).collect();

        let response = tokio_test::block_on(async {
            let bridge = bridge().await;
            let request = DavRequest::new(DavMethod::Post, CALENDAR)
                .with_header(header::CONTENT_TYPE, "text/calendar")
                .with_body(body);
            bridge.handle(request).await
        });

        prop_assert_eq!(response.status, StatusCode::MULTI_STATUS);
        prop_assert_eq!(response_count(&response), uids.len());
        let text = response.body_text();
        let positions: Vec<usize> = uids
            .iter()
            .map(|uid| text.find(&format!("<CS:uid>{uid}</CS:uid>")).unwrap_or(usize::MAX))
            .collect();
        prop_assert!(positions.iter().all(|position| *position != usize::MAX));
        prop_assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    /// Storing identical data twice leaves the entity tag unchanged.
    #[test]
    fn etag_is_stable_for_identical_data(uid in "[a-z]{1,12}") {
        let (first, second) = tokio_test::block_on(async {
            let bridge = bridge().await;
            put_event(&bridge, "item.ics", event(&uid)).await;
            let url = format!("{CALENDAR}item.ics");
            let first = get(&bridge, &url).await.header(header::ETAG).map(str::to_string);
            put_event(&bridge, "item.ics", event(&uid)).await;
            let second = get(&bridge, &url).await.header(header::ETAG).map(str::to_string);
            (first, second)
        });
        prop_assert!(first.is_some());
        prop_assert_eq!(first, second);
    }
}
