use pma_sort::config::Config;

mod common;

/// Scenario 5: one more PMA than the configured fanout forces a
/// second tier - a single incremental-merge child absorbs the
/// overflow pair, and the root still merges everything into one
/// correctly sorted sequence.
#[test]
fn one_more_pma_than_fanout_forces_a_second_tier() -> anyhow::Result<()> {
    common::setup();
    let fanout = 16;
    // max_pma_bytes = 1, so every push (5 bytes as a PMA payload)
    // spills its own single-record PMA.
    let mut sorter = common::new_sorter(Config::new(1, 1, 0, 0, fanout));

    let mut expected: Vec<Vec<u8>> = Vec::new();
    for i in 0..(fanout + 1) {
        let record = format!("{:04}", fanout - i).into_bytes();
        expected.push(record.clone());
        sorter.write(&record)?;
    }
    expected.sort();

    sorter.rewind()?;
    let out = common::drain(&mut sorter)?;
    assert_eq!(out, expected);
    Ok(())
}

/// A deeper input still comes back fully sorted: three tiers' worth
/// of PMAs (fanout^2 + a handful more) over a small fanout.
#[test]
fn several_tiers_of_incremental_merging_still_sort_correctly() -> anyhow::Result<()> {
    common::setup();
    let fanout = 3;
    let mut sorter = common::new_sorter(Config::new(1, 1, 0, 0, fanout));

    let count = fanout * fanout + 2; // forces at least three merge tiers
    let mut expected: Vec<Vec<u8>> = Vec::new();
    for i in 0..count {
        let record = format!("{:04}", count - i).into_bytes();
        expected.push(record.clone());
        sorter.write(&record)?;
    }
    expected.sort();

    sorter.rewind()?;
    let out = common::drain(&mut sorter)?;
    assert_eq!(out, expected);
    Ok(())
}
