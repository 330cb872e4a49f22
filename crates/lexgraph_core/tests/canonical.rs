use lexgraph_core::{canonicalize_document, canonicalize_record, ExternalSorter, MetaCatalog, ObjectId};
use proptest::prelude::*;

fn messy_entry(
    id: ObjectId,
    homograph: i64,
    forms: &[(String, String)],
    hidden: bool,
) -> String {
    let alternatives: String = forms
        .iter()
        .map(|(ws, text)| format!(r#"<AUni ws="{ws}">{text}</AUni>"#))
        .collect();
    format!(
        r#"<rt guid="{id}" class="LexEntry"><DoNotPublish val="{}"/><CitationForm>{alternatives}</CitationForm><HomographNumber val="{homograph}"/></rt>"#,
        if hidden { "True" } else { "False" }
    )
}

fn document(records: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<languageproject version=\"7000072\">\n");
    for record in records {
        xml.push_str(record);
        xml.push('\n');
    }
    xml.push_str("</languageproject>\n");
    xml
}

#[test]
fn canonical_record_puts_class_before_guid_and_fields_in_schema_order() {
    let id = ObjectId::parse("00000000-0000-4000-8000-000000000042").unwrap();
    let forms = vec![
        ("fr".to_string(), "chat".to_string()),
        ("en".to_string(), "cat".to_string()),
    ];
    let canonical =
        canonicalize_record(&MetaCatalog::builtin(), &messy_entry(id, 2, &forms, false)).unwrap();
    let expected = r#"<rt class="LexEntry" guid="00000000-0000-4000-8000-000000000042">
  <CitationForm>
    <AUni ws="en">cat</AUni>
    <AUni ws="fr">chat</AUni>
  </CitationForm>
  <HomographNumber val="2"/>
  <DoNotPublish val="False"/>
</rt>"#;
    assert_eq!(canonical, expected);
}

#[test]
fn spilled_and_in_memory_documents_are_identical() {
    let records: Vec<String> = (0..40)
        .map(|n| messy_entry(ObjectId::new(), n, &[("en".to_string(), format!("w{n}"))], n % 2 == 0))
        .collect();
    let xml = document(&records);
    let catalog = MetaCatalog::builtin();

    let roomy = canonicalize_document(&catalog, &xml, ExternalSorter::new(64 * 1024 * 1024)).unwrap();
    let cramped = canonicalize_document(&catalog, &xml, ExternalSorter::new(512)).unwrap();
    assert_eq!(roomy, cramped);
    assert_eq!(
        canonicalize_document(&catalog, &roomy, ExternalSorter::new(512)).unwrap(),
        roomy
    );

    let guids: Vec<&str> = roomy
        .lines()
        .filter_map(|line| line.strip_prefix(r#"<rt class="LexEntry" guid=""#))
        .map(|rest| &rest[..36])
        .collect();
    let mut sorted = guids.clone();
    sorted.sort();
    assert_eq!(guids.len(), 40);
    assert_eq!(guids, sorted);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn canonicalization_is_idempotent(
        homograph in any::<i64>(),
        forms in prop::collection::vec(("[a-z]{2,3}", "[a-z][a-z ]{0,8}"), 0..5),
        hidden in any::<bool>(),
    ) {
        let catalog = MetaCatalog::builtin();
        let xml = messy_entry(ObjectId::new(), homograph, &forms, hidden);
        let once = canonicalize_record(&catalog, &xml).unwrap();
        let twice = canonicalize_record(&catalog, &once).unwrap();
        prop_assert_eq!(&once, &twice);
        prop_assert!(once.starts_with(r#"<rt class="LexEntry" guid=""#));
    }
}
