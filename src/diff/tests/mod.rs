mod tests_classify;
