use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use pubsubsql::{Action, Command, Engine, EngineConfig, Filter, Projection, Response, parse};

fn arb_column() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Ticker".to_string()),
        Just("Price".to_string()),
        Just("MarketCap".to_string()),
        Just("Bid".to_string()),
    ]
}

fn arb_value() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ,'.=)]{0,8}"
}

fn arb_filter() -> impl Strategy<Value = Filter> {
    prop::collection::vec((arb_column(), arb_value()), 0..3).prop_map(|pairs| {
        let mut filter = Filter::all();
        for (column, value) in pairs {
            filter = filter.and(column, value);
        }
        filter
    })
}

fn arb_projection() -> impl Strategy<Value = Projection> {
    prop_oneof![
        Just(Projection::All),
        prop::collection::vec(arb_column(), 1..3).prop_map(Projection::Columns),
    ]
}

fn arb_command() -> impl Strategy<Value = Command> {
    let table = prop_oneof![Just("Stocks".to_string()), Just("Bonds".to_string())];
    (table, arb_filter(), arb_projection()).prop_flat_map(|(table, filter, projection)| {
        prop_oneof![
            arb_value().prop_map({
                let table = table.clone();
                move |value| Command::Insert {
                    table: table.clone(),
                    columns: vec!["Ticker".into()],
                    values: vec![value],
                }
            }),
            arb_value().prop_map({
                let (table, filter) = (table.clone(), filter.clone());
                move |value| Command::Update {
                    table: table.clone(),
                    assignments: vec![pubsubsql::Assignment {
                        column: "Price".into(),
                        value,
                    }],
                    filter: filter.clone(),
                }
            }),
            Just(Command::Delete {
                table: table.clone(),
                filter: filter.clone(),
            }),
            Just(Command::Subscribe {
                table: table.clone(),
                projection: projection.clone(),
                filter: filter.clone(),
            }),
            Just(Command::Select {
                table,
                projection,
                filter,
            }),
        ]
    })
}

#[derive(Debug, Clone)]
enum Op {
    Insert(String),
    Update(usize, String),
    Delete(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    let tag = prop_oneof![Just("x".to_string()), Just("y".to_string()), Just("z".to_string())];
    prop_oneof![
        tag.clone().prop_map(Op::Insert),
        (any::<usize>(), tag).prop_map(|(i, c)| Op::Update(i, c)),
        any::<usize>().prop_map(Op::Delete),
    ]
}

#[derive(Debug, Clone)]
enum KeyOp {
    Insert(String, String),
    SetKey(String, String),
    Delete(String),
}

fn arb_key_op() -> impl Strategy<Value = KeyOp> {
    let key = prop_oneof![Just("a"), Just("b"), Just("c"), Just("d")].prop_map(String::from);
    let group = prop_oneof![Just("1"), Just("2")].prop_map(String::from);
    prop_oneof![
        (key.clone(), group.clone()).prop_map(|(k, g)| KeyOp::Insert(k, g)),
        (group, key.clone()).prop_map(|(g, k)| KeyOp::SetKey(g, k)),
        key.prop_map(KeyOp::Delete),
    ]
}

proptest! {
    #[test]
    fn display_parse_roundtrip(command in arb_command()) {
        let rendered = command.to_string();
        let reparsed = parse(&rendered).expect("rendered command should reparse");
        prop_assert_eq!(command, reparsed);
    }

    #[test]
    fn key_values_stay_unique(ops in prop::collection::vec(arb_key_op(), 1..40)) {
        let engine = Arc::new(Engine::new());
        let session = engine.connect();
        session.execute("key T k").unwrap();

        for op in ops {
            let command = match op {
                KeyOp::Insert(k, g) => format!("insert into T (k, g) values ({k}, {g})"),
                KeyOp::SetKey(g, k) => format!("update T set k = {k} where g = {g}"),
                KeyOp::Delete(k) => format!("delete from T where k = {k}"),
            };
            // duplicate key rejections are expected here
            let _ = session.execute(&command);

            let Response::Selected(rows) = session.execute("select k from T").unwrap() else {
                panic!("select should return rows");
            };
            let mut seen = HashSet::new();
            for row in rows.iter() {
                let key = row.value("k").unwrap_or_default().to_string();
                prop_assert!(seen.insert(key.clone()), "duplicate key {} after {}", key, command);
            }
        }
    }

    #[test]
    fn subscription_sees_exactly_matching_changes(ops in prop::collection::vec(arb_op(), 1..40)) {
        let engine = Arc::new(Engine::with_config(EngineConfig::default().with_max_pending(None)));
        let client = engine.connect();
        let subscriber = engine.connect();
        subscriber.execute("subscribe id from T where c = x").unwrap();

        // row id -> current value of c
        let mut model: BTreeMap<u64, String> = BTreeMap::new();
        let mut expected: Vec<(Action, u64)> = Vec::new();

        for op in ops {
            match op {
                Op::Insert(c) => {
                    let Response::Inserted { id } =
                        client.execute(&format!("insert into T (c) values ({c})")).unwrap()
                    else {
                        panic!("insert should report the row id");
                    };
                    if c == "x" {
                        expected.push((Action::Insert, id));
                    }
                    model.insert(id, c);
                }
                Op::Update(i, c) => {
                    if model.is_empty() {
                        continue;
                    }
                    let id = *model.keys().nth(i % model.len()).unwrap();
                    client.execute(&format!("update T set c = {c} where id = {id}")).unwrap();
                    let before = model.insert(id, c.clone()).unwrap_or_default();
                    match (before == "x", c == "x") {
                        (true, true) => expected.push((Action::Update, id)),
                        (false, true) => expected.push((Action::Add, id)),
                        (true, false) => expected.push((Action::Remove, id)),
                        (false, false) => {}
                    }
                }
                Op::Delete(i) => {
                    if model.is_empty() {
                        continue;
                    }
                    let id = *model.keys().nth(i % model.len()).unwrap();
                    client.execute(&format!("delete from T where id = {id}")).unwrap();
                    if model.remove(&id).as_deref() == Some("x") {
                        expected.push((Action::Delete, id));
                    }
                }
            }
        }

        let mut received = Vec::new();
        while let Some(batch) = subscriber.try_next() {
            for row in batch.rows.iter() {
                let id: u64 = row.value("id").unwrap().parse().unwrap();
                received.push((batch.action, id));
            }
        }
        prop_assert_eq!(received, expected);
    }
}
