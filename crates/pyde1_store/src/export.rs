//! Legacy export: renders one closed sequence's pressure/flow/temperature
//! trace into the tab-and-whitespace format older plotting tools expect.
//! A side function, not wired into any request path.

/// One row of the exported trace, already time-ordered by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotSampleRow {
    pub sample_time: f64,
    pub group_pressure: f64,
    pub group_flow: f64,
    pub mix_temp: f64,
    pub head_temp: f64,
    pub volume_pour: f64,
}

const HEADER: &str = "time\tpressure\tflow\tmix_temp\thead_temp\tvolume\n";

/// Renders `rows` into the legacy format: a header line followed by one
/// tab-separated line per sample.
pub fn render(rows: &[ShotSampleRow]) -> String {
    let mut out = String::from(HEADER);
    for row in rows {
        out.push_str(&format!(
            "{:.2}\t{:.2}\t{:.2}\t{:.1}\t{:.1}\t{:.2}\n",
            row.sample_time, row.group_pressure, row.group_flow, row.mix_temp, row.head_temp, row.volume_pour
        ));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn renders_header_then_one_line_per_row() {
        let rows = vec![ShotSampleRow {
            sample_time: 1.0,
            group_pressure: 6.0,
            group_flow: 2.0,
            mix_temp: 92.0,
            head_temp: 92.5,
            volume_pour: 4.0,
        }];
        let text = render(&rows);
        assert!(text.starts_with("time\tpressure"));
        assert!(text.contains("1.00\t6.00\t2.00\t92.0\t92.5\t4.00"));
    }

    #[test]
    fn empty_rows_still_emit_the_header() {
        assert_eq!(render(&[]), HEADER);
    }
}
