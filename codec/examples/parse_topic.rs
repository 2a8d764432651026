// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use loro_codec::{PubTopic, SubTopic};

fn main() {
    let filter = SubTopic::new("$SYS/dev/cpu/+").unwrap();
    println!("filter: {filter:?}");
    assert!(filter.is_match("$SYS/dev/cpu/01"));
    assert!(!filter.is_match("$SYS/dev/cpu/01/temp"));

    let filter = SubTopic::new("sport/#").unwrap();
    assert!(filter.is_match("sport"));
    assert!(filter.is_match("sport/tennis/player1"));
    // Filters without a leading `$` never match server internal topics.
    assert!(!filter.is_match("$SYS/dev/cpu/01"));

    // Wildcards only occupy whole levels.
    assert!(SubTopic::new("sport+").is_err());
    assert!(SubTopic::new("sport/tennis/#/ranking").is_err());

    // Topic names take no wildcards at all.
    let topic = PubTopic::new("sport/tennis/player1").unwrap();
    println!("topic: {topic}");
    assert!(PubTopic::new("sport/+").is_err());
}
