// 静态链接 ffmpeg (vcpkg) 时 Windows MSVC 需要额外的系统库
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(all(target_os = "windows", target_env = "msvc"))]
    for lib in ["libmfx", "libx264", "oleaut32", "vfw32", "secur32", "strmiids", "ole32"] {
        println!("cargo:rustc-link-lib=dylib={}", lib);
    }
}
