use std::sync::LazyLock;

use prometheus::*;

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "sem_search_count",
        "count of search requests",
        &["mode", "enhanced"]
    )
    .unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "sem_search_duration",
        "duration of the search pipeline in seconds",
        &["mode"]
    )
    .unwrap()
});

static METRIC_SEARCH_TOP_SCORE: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "sem_search_top_score",
        "final score of the best match",
        (-10..=10).map(|x| x as f64 / 10.0).collect()
    )
    .unwrap()
});

/// 增加搜索请求计数
pub fn inc_search_count(mode: &str, enhanced: bool) {
    METRIC_SEARCH_COUNT.with_label_values(&[mode, if enhanced { "1" } else { "0" }]).inc();
}

pub fn observe_search_duration(mode: &str, duration: f32) {
    METRIC_SEARCH_DURATION.with_label_values(&[mode]).observe(duration as f64);
}

pub fn observe_top_score(score: f32) {
    METRIC_SEARCH_TOP_SCORE.observe(score as f64);
}
