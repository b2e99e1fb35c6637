//! Property tests for the wire codec and line re-assembly.

use ecoslink::station::assembler::MessageAssembler;
use ecoslink::station::codec::{self, Cursor};
use ecoslink::station::splitter::LineSplitter;
use ecoslink::{ObjectOption, Value};
use proptest::prelude::*;

fn name_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[A-Za-z][A-Za-z0-9_]{0,11}")
        .unwrap_or_else(|e| panic!("regex failed: {e}"))
}

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(Value::Int),
        proptest::string::string_regex("[A-Za-z_.][A-Za-z0-9_.:-]{0,8}")
            .unwrap_or_else(|e| panic!("regex failed: {e}"))
            .prop_map(Value::Symbol),
        proptest::string::string_regex("[^\r\n]{0,16}")
            .unwrap_or_else(|e| panic!("regex failed: {e}"))
            .prop_map(Value::Text),
    ]
}

fn option_strategy() -> impl Strategy<Value = ObjectOption> {
    (name_strategy(), prop::collection::vec(value_strategy(), 0..5))
        .prop_map(|(name, values)| ObjectOption::new(name, values))
}

fn transcript() -> String {
    [
        "<REPLY get(1,info,status)>",
        "1 ECoS2",
        "1 ProtocolVersion[0.5]",
        "1 status[GO]",
        "<END 0 (OK)>",
        "<EVENT 1002>",
        "1002 name[\"Gr\u{fc}ne \"\"Lok\"\"\"] func[3,1]",
        "<END 0 (OK)>",
        "<REPLY get(8,broken)>",
        "8 broken[1",
        "<END 0 (OK)>",
        "<REPLY set(5,stop)>",
        "<END 11 (Object not found)>",
    ]
    .join("\r\n")
        + "\r\n"
}

fn assemble(chunks: &[&[u8]]) -> Vec<String> {
    let mut splitter = LineSplitter::new();
    let mut assembler = MessageAssembler::new(false);
    chunks
        .iter()
        .flat_map(|chunk| splitter.feed(chunk, &mut assembler))
        .map(|message| format!("{message:?}"))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

    #[test]
    fn written_options_parse_back(option in option_strategy()) {
        let wire = codec::write_option(&option)
            .unwrap_or_else(|e| panic!("write failed: {e}"));
        let parsed = codec::parse_option(&mut Cursor::new(&wire))
            .unwrap_or_else(|e| panic!("parse of `{wire}` failed: {e}"));
        prop_assert_eq!(parsed, option);
    }

    #[test]
    fn written_commands_parse_back(
        name in name_strategy(),
        id in any::<i32>(),
        options in prop::collection::vec(option_strategy(), 0..4),
    ) {
        let wire = codec::write_command(&name, id, &options)
            .unwrap_or_else(|e| panic!("write failed: {e}"));
        let parsed = codec::parse_command(&wire)
            .unwrap_or_else(|e| panic!("parse of `{wire}` failed: {e}"));
        prop_assert_eq!(parsed.name, name);
        prop_assert_eq!(parsed.id, id);
        prop_assert_eq!(parsed.options, options);
    }

    #[test]
    fn line_breaks_in_text_become_spaces(text in "[a-z \r\n\"]{0,24}") {
        let option = ObjectOption::named("name").with(Value::text(text.clone()));
        let wire = codec::write_option(&option)
            .unwrap_or_else(|e| panic!("write failed: {e}"));
        let parsed = codec::parse_option(&mut Cursor::new(&wire))
            .unwrap_or_else(|e| panic!("parse of `{wire}` failed: {e}"));
        let expected: String = text
            .chars()
            .filter(|ch| *ch != '\r')
            .map(|ch| if ch == '\n' { ' ' } else { ch })
            .collect();
        prop_assert_eq!(parsed.text(0), Some(expected.as_str()));
    }

    #[test]
    fn chunking_does_not_change_messages(cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12)) {
        let text = transcript();
        let bytes = text.as_bytes();
        let mut points: Vec<usize> = cuts.iter().map(|cut| cut.index(bytes.len() + 1)).collect();
        points.sort_unstable();
        points.dedup();

        let mut chunks = Vec::new();
        let mut start = 0;
        for point in points {
            chunks.push(&bytes[start..point]);
            start = point;
        }
        chunks.push(&bytes[start..]);

        prop_assert_eq!(assemble(&chunks), assemble(&[bytes]));
    }
}

#[test]
fn whole_transcript_yields_four_outcomes() {
    let text = transcript();
    let messages = assemble(&[text.as_bytes()]);
    assert_eq!(messages.len(), 4);
    assert!(messages[0].starts_with("Reply"));
    assert!(messages[1].starts_with("Event"));
    assert!(messages[2].contains("Format"));
    assert!(messages[3].contains("Object not found"));
}
