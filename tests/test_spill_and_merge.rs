use pma_sort::config::Config;

mod common;

/// Scenario 2: 1024 small fixed-width records under a tight PMA cap,
/// single-threaded. Must spill several PMAs and still come back fully
/// sorted through a single fanout-16 merge tree.
#[test]
fn spills_many_pmas_and_merges_them_back_sorted() -> anyhow::Result<()> {
    common::setup();
    let mut sorter = common::new_sorter(Config::new(64, 2, 0, 0, 16)); // max_pma_bytes = 128

    let mut expected: Vec<Vec<u8>> = Vec::new();
    for i in 0..1024u32 {
        let record = format!("{i:03}").into_bytes();
        expected.push(record.clone());
        sorter.write(&record)?;
    }
    expected.sort();

    sorter.rewind()?;
    let out = common::drain(&mut sorter)?;
    assert_eq!(out.len(), 1024);
    assert_eq!(out, expected);
    assert!(common::is_non_decreasing(&out));
    Ok(())
}

/// Boundary: exactly `fanout` PMAs merge with a single `MergeEngine`
/// and no incremental-merge wrapping - forced by flushing after every
/// write so the PMA count is known exactly.
#[test]
fn exactly_fanout_pmas_need_no_incremental_wrapping() -> anyhow::Result<()> {
    common::setup();
    let fanout = 4;
    // max_pma_bytes = 1, so every write spills its own single-record PMA.
    let mut sorter = common::new_sorter(Config::new(1, 1, 0, 0, fanout));
    let mut expected: Vec<Vec<u8>> = Vec::new();
    for i in 0..fanout {
        let record = format!("{:03}", fanout - i).into_bytes();
        expected.push(record.clone());
        sorter.write(&record)?;
    }
    expected.sort();
    sorter.rewind()?;
    let out = common::drain(&mut sorter)?;
    assert_eq!(out, expected);
    Ok(())
}
